use std::any::Any;
use std::path::Path;
use std::process::ExitCode;

use fingergate_core::IdentityRecord;

use crate::cli::{ExportArgs, IdentityArgs, ImportArgs, OutputMode};
use crate::commands::{CommandContext, CommandHandler};
use crate::config::Settings;
use crate::errors::AppResult;
use crate::output::render_registry;
use crate::registry::{self, ExportOutcome, RegistryOutcome};

/// Registry commands that share one handler.
#[derive(Debug, Clone)]
pub enum RegistryRequest {
    List,
    Show(IdentityArgs),
    Delete(IdentityArgs),
    Export(ExportArgs),
    Import(ImportArgs),
}

pub struct RegistryHandler {
    request: RegistryRequest,
    deps: RegistryHandlerDeps,
}

type LookupFn = Box<dyn Fn(&str, &Settings) -> AppResult<IdentityRecord> + Send + Sync>;

pub struct RegistryHandlerDeps {
    pub list: Box<dyn Fn(&Settings) -> AppResult<Vec<IdentityRecord>> + Send + Sync>,
    pub show: LookupFn,
    pub delete: LookupFn,
    pub export: Box<dyn Fn(&ExportArgs, &Settings) -> AppResult<ExportOutcome> + Send + Sync>,
    pub import: Box<dyn Fn(&Path, &Settings) -> AppResult<IdentityRecord> + Send + Sync>,
    pub render: Box<dyn Fn(&RegistryOutcome, OutputMode) -> AppResult<()> + Send + Sync>,
}

impl RegistryHandlerDeps {
    pub fn new(
        list: impl Fn(&Settings) -> AppResult<Vec<IdentityRecord>> + Send + Sync + 'static,
        show: impl Fn(&str, &Settings) -> AppResult<IdentityRecord> + Send + Sync + 'static,
        delete: impl Fn(&str, &Settings) -> AppResult<IdentityRecord> + Send + Sync + 'static,
        export: impl Fn(&ExportArgs, &Settings) -> AppResult<ExportOutcome> + Send + Sync + 'static,
        import: impl Fn(&Path, &Settings) -> AppResult<IdentityRecord> + Send + Sync + 'static,
        render: impl Fn(&RegistryOutcome, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            list: Box::new(list),
            show: Box::new(show),
            delete: Box::new(delete),
            export: Box::new(export),
            import: Box::new(import),
            render: Box::new(render),
        }
    }
}

impl Default for RegistryHandlerDeps {
    fn default() -> Self {
        Self::new(
            registry::run_list,
            registry::run_show,
            registry::run_delete,
            registry::run_export,
            registry::run_import,
            render_registry,
        )
    }
}

impl RegistryHandler {
    pub fn new(request: RegistryRequest) -> Self {
        Self {
            request,
            deps: RegistryHandlerDeps::default(),
        }
    }

    pub fn with_dependencies(request: RegistryRequest, deps: RegistryHandlerDeps) -> Self {
        Self { request, deps }
    }
}

impl CommandHandler for RegistryHandler {
    fn execute(&self, ctx: &CommandContext) -> AppResult<ExitCode> {
        let settings = &ctx.settings;
        let outcome = match &self.request {
            RegistryRequest::List => RegistryOutcome::Listed((self.deps.list)(settings)?),
            RegistryRequest::Show(args) => {
                RegistryOutcome::Shown((self.deps.show)(&args.id, settings)?)
            }
            RegistryRequest::Delete(args) => {
                RegistryOutcome::Deleted((self.deps.delete)(&args.id, settings)?)
            }
            RegistryRequest::Export(args) => {
                RegistryOutcome::Exported((self.deps.export)(args, settings)?)
            }
            RegistryRequest::Import(args) => {
                RegistryOutcome::Imported((self.deps.import)(&args.file, settings)?)
            }
        };
        (self.deps.render)(&outcome, ctx.mode)?;
        Ok(ExitCode::SUCCESS)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

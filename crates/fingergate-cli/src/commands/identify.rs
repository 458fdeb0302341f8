use std::any::Any;
use std::process::ExitCode;

use crate::cli::{IdentifyCommands, OutputMode};
use crate::commands::{CommandContext, CommandHandler};
use crate::config::Settings;
use crate::errors::AppResult;
use crate::output::render_identification;
use crate::registry::{self, IdentificationOutcome};

pub struct IdentifyHandler {
    command: IdentifyCommands,
    run: Box<
        dyn Fn(&IdentifyCommands, &Settings) -> AppResult<IdentificationOutcome> + Send + Sync,
    >,
    render: Box<dyn Fn(&IdentificationOutcome, OutputMode) -> AppResult<()> + Send + Sync>,
}

impl IdentifyHandler {
    pub fn new(command: IdentifyCommands) -> Self {
        Self::with_dependencies(command, registry::run_identification, render_identification)
    }

    pub fn with_dependencies(
        command: IdentifyCommands,
        run: impl Fn(&IdentifyCommands, &Settings) -> AppResult<IdentificationOutcome>
            + Send
            + Sync
            + 'static,
        render: impl Fn(&IdentificationOutcome, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            command,
            run: Box::new(run),
            render: Box::new(render),
        }
    }

    pub fn command(&self) -> IdentifyCommands {
        self.command
    }
}

impl CommandHandler for IdentifyHandler {
    fn execute(&self, ctx: &CommandContext) -> AppResult<ExitCode> {
        let outcome = (self.run)(&self.command, &ctx.settings)?;
        (self.render)(&outcome, ctx.mode)?;
        Ok(ExitCode::SUCCESS)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

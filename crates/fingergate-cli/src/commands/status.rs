use std::any::Any;
use std::process::ExitCode;

use crate::cli::OutputMode;
use crate::commands::{CommandContext, CommandHandler};
use crate::config::Settings;
use crate::errors::AppResult;
use crate::output::render_status;
use crate::registry::{self, StatusReport};

pub struct StatusHandler {
    run_status: Box<dyn Fn(&Settings) -> AppResult<StatusReport> + Send + Sync>,
    render: Box<dyn Fn(&StatusReport, OutputMode) -> AppResult<()> + Send + Sync>,
}

impl StatusHandler {
    pub fn new() -> Self {
        Self::with_dependencies(registry::run_status, render_status)
    }

    pub fn with_dependencies(
        run_status: impl Fn(&Settings) -> AppResult<StatusReport> + Send + Sync + 'static,
        render: impl Fn(&StatusReport, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            run_status: Box::new(run_status),
            render: Box::new(render),
        }
    }
}

impl Default for StatusHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandHandler for StatusHandler {
    fn execute(&self, ctx: &CommandContext) -> AppResult<ExitCode> {
        let report = (self.run_status)(&ctx.settings)?;
        (self.render)(&report, ctx.mode)?;
        let exit = if report.service.initialized {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(4)
        };
        Ok(exit)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

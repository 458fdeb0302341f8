use std::any::Any;
use std::process::ExitCode;

use fingergate_core::enrollment::EnrollmentOutcome;

use crate::cli::{EnrollArgs, OutputMode};
use crate::commands::{CommandContext, CommandHandler};
use crate::config::Settings;
use crate::errors::AppResult;
use crate::output::render_enroll;
use crate::registry;

pub struct EnrollHandler {
    args: EnrollArgs,
    run: Box<dyn Fn(&EnrollArgs, &Settings) -> AppResult<EnrollmentOutcome> + Send + Sync>,
    render: Box<dyn Fn(&EnrollmentOutcome, OutputMode, bool) -> AppResult<()> + Send + Sync>,
}

impl EnrollHandler {
    pub fn new(args: EnrollArgs) -> Self {
        Self::with_dependencies(args, registry::run_enroll, render_enroll)
    }

    pub fn with_dependencies(
        args: EnrollArgs,
        run: impl Fn(&EnrollArgs, &Settings) -> AppResult<EnrollmentOutcome> + Send + Sync + 'static,
        render: impl Fn(&EnrollmentOutcome, OutputMode, bool) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            args,
            run: Box::new(run),
            render: Box::new(render),
        }
    }
}

impl CommandHandler for EnrollHandler {
    fn execute(&self, ctx: &CommandContext) -> AppResult<ExitCode> {
        let outcome = (self.run)(&self.args, &ctx.settings)?;
        (self.render)(&outcome, ctx.mode, ctx.verbose)?;
        Ok(ExitCode::SUCCESS)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

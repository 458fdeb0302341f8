use std::any::Any;
use std::process::ExitCode;

use crate::cli::{OutputMode, ServeArgs};
use crate::commands::{CommandContext, CommandHandler};
use crate::config::Settings;
use crate::errors::AppResult;
use crate::output::render_serve;
use crate::serve::{self, ServeOutcome};

pub struct ServeHandler {
    args: ServeArgs,
    run: Box<dyn Fn(&ServeArgs, &Settings) -> AppResult<ServeOutcome> + Send + Sync>,
    render: Box<dyn Fn(&ServeOutcome, OutputMode) -> AppResult<()> + Send + Sync>,
}

impl ServeHandler {
    pub fn new(args: ServeArgs) -> Self {
        Self::with_dependencies(args, serve::run_serve, render_serve)
    }

    pub fn with_dependencies(
        args: ServeArgs,
        run: impl Fn(&ServeArgs, &Settings) -> AppResult<ServeOutcome> + Send + Sync + 'static,
        render: impl Fn(&ServeOutcome, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            args,
            run: Box::new(run),
            render: Box::new(render),
        }
    }
}

impl CommandHandler for ServeHandler {
    fn execute(&self, ctx: &CommandContext) -> AppResult<ExitCode> {
        let outcome = (self.run)(&self.args, &ctx.settings)?;
        (self.render)(&outcome, ctx.mode)?;
        Ok(ExitCode::SUCCESS)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

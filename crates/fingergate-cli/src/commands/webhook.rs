use std::any::Any;
use std::process::ExitCode;

use crate::cli::{OutputMode, WebhookCommands};
use crate::commands::{CommandContext, CommandHandler};
use crate::config::Settings;
use crate::errors::AppResult;
use crate::output::render_webhook_test;
use crate::webhook::{self, WebhookTestOutcome};

pub struct WebhookHandler {
    command: WebhookCommands,
    test: Box<dyn Fn(&Settings) -> AppResult<WebhookTestOutcome> + Send + Sync>,
    render: Box<dyn Fn(&WebhookTestOutcome, OutputMode) -> AppResult<()> + Send + Sync>,
}

impl WebhookHandler {
    pub fn new(command: WebhookCommands) -> Self {
        Self::with_dependencies(command, webhook::run_webhook_test, render_webhook_test)
    }

    pub fn with_dependencies(
        command: WebhookCommands,
        test: impl Fn(&Settings) -> AppResult<WebhookTestOutcome> + Send + Sync + 'static,
        render: impl Fn(&WebhookTestOutcome, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            command,
            test: Box::new(test),
            render: Box::new(render),
        }
    }
}

impl CommandHandler for WebhookHandler {
    fn execute(&self, ctx: &CommandContext) -> AppResult<ExitCode> {
        match self.command {
            WebhookCommands::Test => {
                let outcome = (self.test)(&ctx.settings)?;
                (self.render)(&outcome, ctx.mode)?;
                let exit = if outcome.delivered {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::from(1)
                };
                Ok(exit)
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

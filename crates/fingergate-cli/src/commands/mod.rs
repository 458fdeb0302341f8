use std::any::Any;
use std::process::ExitCode;

use crate::cli::{Commands, OutputMode};
use crate::config::Settings;
use crate::errors::AppResult;

/// Per-invocation state shared by every handler.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub mode: OutputMode,
    pub verbose: bool,
    pub settings: Settings,
}

pub trait CommandHandler: Send + Sync {
    fn execute(&self, ctx: &CommandContext) -> AppResult<ExitCode>;
    fn as_any(&self) -> &dyn Any;
}

mod enroll;
mod identify;
mod registry;
mod serve;
mod status;
mod webhook;

pub use enroll::EnrollHandler;
pub use identify::IdentifyHandler;
pub use registry::{RegistryHandler, RegistryHandlerDeps, RegistryRequest};
pub use serve::ServeHandler;
pub use status::StatusHandler;
pub use webhook::WebhookHandler;

impl From<Commands> for Box<dyn CommandHandler> {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Serve(args) => Box::new(ServeHandler::new(args)),
            Commands::Enroll(args) => Box::new(EnrollHandler::new(args)),
            Commands::List => Box::new(RegistryHandler::new(RegistryRequest::List)),
            Commands::Show(args) => Box::new(RegistryHandler::new(RegistryRequest::Show(args))),
            Commands::Delete(args) => {
                Box::new(RegistryHandler::new(RegistryRequest::Delete(args)))
            }
            Commands::Export(args) => {
                Box::new(RegistryHandler::new(RegistryRequest::Export(args)))
            }
            Commands::Import(args) => {
                Box::new(RegistryHandler::new(RegistryRequest::Import(args)))
            }
            Commands::Status => Box::new(StatusHandler::new()),
            Commands::Identify(cmd) => Box::new(IdentifyHandler::new(cmd)),
            Commands::Webhook(cmd) => Box::new(WebhookHandler::new(cmd)),
        }
    }
}

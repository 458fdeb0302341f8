use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "fingergate",
    about = "Fingerprint enrollment and identification for door access control",
    version
)]
pub struct Cli {
    /// Emit structured JSON to stdout instead of human-readable logs
    #[arg(long)]
    pub json: bool,

    /// Increase verbosity (may be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file to use instead of the system search path
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Environment file loaded before configuration (defaults to ./.env)
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Run the identification loop until SIGINT or SIGTERM
    Serve(ServeArgs),
    /// Enroll a new identity from three captures of the same finger
    Enroll(EnrollArgs),
    /// List registered identities
    List,
    /// Show a single identity
    Show(IdentityArgs),
    /// Delete an identity and its stored artifacts
    Delete(IdentityArgs),
    /// Export an identity as a portable JSON envelope
    Export(ExportArgs),
    /// Import an identity from an exported JSON envelope
    Import(ImportArgs),
    /// Report sensor and registry status
    Status,
    /// Start or stop identification in the running service
    #[command(subcommand)]
    Identify(IdentifyCommands),
    /// Webhook notification utilities
    #[command(subcommand)]
    Webhook(WebhookCommands),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum IdentifyCommands {
    /// Resume the identification loop
    Start,
    /// Pause the identification loop while keeping the sensor open
    Stop,
}

#[derive(Debug, Clone, Subcommand)]
pub enum WebhookCommands {
    /// Post a TEST envelope to the configured webhook
    Test,
}

#[derive(Debug, Clone, Default, Args)]
pub struct ServeArgs {
    /// Open the sensor without starting the identification loop
    #[arg(long)]
    pub no_identify: bool,
}

#[derive(Debug, Clone, Args)]
pub struct EnrollArgs {
    /// Display name for the new identity (case-insensitively unique)
    #[arg(long)]
    pub name: String,

    /// Role assigned to the identity (Admin or User)
    #[arg(long)]
    pub role: Option<String>,

    /// Seconds to wait for three accepted captures (defaults to config)
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Args)]
pub struct IdentityArgs {
    /// Identity id as shown by `list`
    pub id: String,
}

#[derive(Debug, Clone, Args)]
pub struct ExportArgs {
    /// Identity id as shown by `list`
    pub id: String,

    /// Write the envelope to this file instead of stdout
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct ImportArgs {
    /// Envelope produced by `export`
    pub file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl From<bool> for OutputMode {
    fn from(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

impl Cli {
    pub fn output_mode(&self) -> OutputMode {
        OutputMode::from(self.json)
    }
}

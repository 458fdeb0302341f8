use std::process::ExitCode;

use clap::Parser;

use fingergate_cli::cli::{Cli, Commands};
use fingergate_cli::commands::{CommandContext, CommandHandler};
use fingergate_cli::config as config_loader;
use fingergate_cli::logging::init_tracing;
use fingergate_cli::output::render_error;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mode = cli.output_mode();

    let settings = match config_loader::load_settings(cli.config.as_deref(), cli.env_file.as_deref())
    {
        Ok(settings) => settings,
        Err(err) => {
            init_tracing(cli.verbose, None);
            render_error(&err, mode);
            return err.exit_code();
        }
    };

    let scan_log_dir = match cli.command {
        Commands::Serve(_) | Commands::Enroll(_) => Some(settings.resolved.log_dir.clone()),
        _ => None,
    };
    let _guard = init_tracing(cli.verbose, scan_log_dir.as_deref());
    config_loader::log_sources(&settings);

    let ctx = CommandContext {
        mode,
        verbose: cli.verbose > 0,
        settings,
    };
    let handler: Box<dyn CommandHandler> = cli.command.into();
    match handler.execute(&ctx) {
        Ok(code) => code,
        Err(err) => {
            render_error(&err, mode);
            err.exit_code()
        }
    }
}

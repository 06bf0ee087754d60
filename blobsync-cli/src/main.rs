//! blobsync CLI - Command-line interface
//!
//! Thin front end over the `blobsync` library: parses arguments, sets up
//! logging and maps failures to exit codes.

mod commands;
mod error;
mod logging;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use commands::config::ConfigCommands;
use commands::download::DownloadArgs;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "blobsync", version = blobsync::VERSION, about)]
struct Cli {
    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download sources from a blob store into a local directory
    Download(DownloadArgs),

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

fn main() {
    let cli = Cli::parse();

    let guard = match logging::init(cli.verbose, cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(e.exit_code());
        }
    };

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {}", e);
        // process::exit skips destructors; flush the log file first.
        drop(guard);
        process::exit(e.exit_code());
    }
}

fn run(command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Download(args) => commands::download::run(args),
        Commands::Config(command) => commands::config::run(command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_config_path() {
        let cli = Cli::try_parse_from(["blobsync", "-v", "config", "path"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Path)));
    }
}

//! Configuration management CLI commands.
//!
//! Provides `config list`, `config path` and `config init` for inspecting
//! and seeding the configuration file.

use std::path::{Path, PathBuf};

use blobsync::config::{config_file_path, ConfigFile};
use clap::Subcommand;

use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// List all configuration settings
    List {
        /// Read this file instead of ~/.blobsync/config.ini
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Show the configuration file path
    Path,

    /// Write a configuration file populated with defaults
    Init {
        /// Write to this file instead of ~/.blobsync/config.ini
        #[arg(long)]
        file: Option<PathBuf>,

        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run a config subcommand.
pub fn run(command: ConfigCommands) -> Result<(), CliError> {
    match command {
        ConfigCommands::List { file } => run_list(file),
        ConfigCommands::Path => run_path(),
        ConfigCommands::Init { file, force } => {
            let path = resolve(file)?;
            init_config(&path, force)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
    }
}

fn resolve(file: Option<PathBuf>) -> Result<PathBuf, CliError> {
    match file {
        Some(path) => Ok(path),
        None => Ok(config_file_path()?),
    }
}

/// List all configuration settings, grouped by section.
fn run_list(file: Option<PathBuf>) -> Result<(), CliError> {
    let config = ConfigFile::load_from(&resolve(file)?)?;

    println!("Configuration Settings");
    println!("======================");
    print!("{}", format_entries(&config));
    Ok(())
}

fn format_entries(config: &ConfigFile) -> String {
    let mut out = String::new();
    let entries = config.entries();
    let mut current_section = "";

    for (key, value) in &entries {
        let Some((section, name)) = key.split_once('.') else {
            continue;
        };
        if section != current_section {
            out.push('\n');
            out.push_str(&format!("[{}]\n", section));
            current_section = section;
        }
        out.push_str(&format!("  {} = {}\n", name, value));
    }

    out
}

fn run_path() -> Result<(), CliError> {
    println!("{}", config_file_path()?.display());
    Ok(())
}

/// Write the default configuration to `path`.
fn init_config(path: &Path, force: bool) -> Result<(), CliError> {
    if path.exists() && !force {
        return Err(CliError::Config(format!(
            "{} already exists (use --force to replace it)",
            path.display()
        )));
    }
    ConfigFile::default().save_to(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_entries_groups_sections() {
        let listing = format_entries(&ConfigFile::default());

        assert!(listing.contains("[download]\n"));
        assert!(listing.contains("[skip_on]\n"));
        assert!(listing.contains("[concurrency]\n"));
        assert!(listing.contains("  overwrite = true\n"));
        assert_eq!(listing.matches("[download]").count(), 1);
    }

    #[test]
    fn test_init_writes_loadable_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.ini");

        init_config(&path, false).unwrap();
        assert_eq!(ConfigFile::load_from(&path).unwrap(), ConfigFile::default());
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");
        std::fs::write(&path, "[download]\noverwrite = false\n").unwrap();

        assert!(matches!(init_config(&path, false), Err(CliError::Config(_))));
        assert!(!ConfigFile::load_from(&path).unwrap().download.overwrite);

        init_config(&path, true).unwrap();
        assert!(ConfigFile::load_from(&path).unwrap().download.overwrite);
    }
}

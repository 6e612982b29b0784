use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use watchtower::config::Config;
use watchtower::error::ConfigError;
use watchtower::MonitoringEngine;

/// Command-line arguments for the watchtower daemon
#[derive(Parser)]
#[command(
    name = "watchtower",
    about = "Metrics collection and alert-evaluation engine",
    long_about = "Periodically samples system, application and business metrics, evaluates \
                  threshold alert rules against the latest values and dispatches notifications \
                  for the alerts they raise."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Override the storage path from the configuration
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "JSON state file; metric history goes to <stem>.metrics.jsonl beside it"
    )]
    storage: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// # Returns
    ///
    /// `Ok(())` if all arguments are valid, `Err(String)` with error message otherwise
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            // Missing files fall back to defaults in load_config
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }

                if let Some(extension) = config_path.extension() {
                    if extension != "toml" {
                        warn!(
                            "Configuration file does not have .toml extension: {}",
                            config_path.display()
                        );
                    }
                }
            }
        }

        if let Some(ref storage_path) = self.storage {
            check_storage_path(storage_path)?;
        }

        Ok(())
    }
}

/// A storage path must name a file in an existing directory
fn check_storage_path(path: &Path) -> Result<(), String> {
    if path.is_dir() {
        return Err(format!(
            "Storage path is a directory, expected a file: {}",
            path.display()
        ));
    }

    // A bare file name lives in the working directory
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(()),
    };
    if !parent.is_dir() {
        return Err(format!(
            "Storage directory does not exist: {}",
            parent.display()
        ));
    }
    Ok(())
}

/// Load configuration from file or use defaults
///
/// A missing or unreadable file yields the defaults with a warning. A file
/// that exists but is invalid is an error.
fn load_config(config_path: Option<&Path>) -> Result<Config, ConfigError> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            match Config::from_file(path) {
                Ok(config) => Ok(config),
                Err(ConfigError::ReadError(e)) => {
                    warn!("Configuration file not readable ({}), using defaults", e);
                    Ok(Config::default())
                }
                Err(e) => Err(e),
            }
        }
        None => {
            info!("Using default configuration");
            Ok(Config::default())
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let engine = MonitoringEngine::builder(config)
        .with_default_collectors()
        .build()
        .context("failed to build monitoring engine")?;

    let (shutdown_sender, mut shutdown_receiver) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        if let Err(e) = shutdown_sender.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    })
    .context("failed to install Ctrl-C handler")?;

    engine.start();
    info!("Watchtower is running. Press Ctrl+C to stop.");

    if shutdown_receiver.recv().await.is_none() {
        warn!("Shutdown channel closed unexpectedly");
    }

    engine.shutdown().await;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting watchtower");

    cli.validate().map_err(anyhow::Error::msg)?;
    let mut config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(storage) = cli.storage {
        info!("Using storage path from command line: {}", storage.display());
        config.storage.path = Some(storage);
    }
    if let Some(ref path) = config.storage.path {
        check_storage_path(path).map_err(anyhow::Error::msg)?;
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(run(config))?;

    info!("Watchtower shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_validation_with_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watchtower.toml");
        std::fs::write(&path, "[engine]\ncollection_interval_seconds = 5\n").unwrap();

        let cli = Cli {
            config: Some(path),
            storage: None,
            verbose: false,
        };
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_cli_validation_with_missing_file() {
        let cli = Cli {
            config: Some(PathBuf::from("/nonexistent/watchtower.toml")),
            storage: None,
            verbose: false,
        };
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_cli_validation_with_directory() {
        let dir = TempDir::new().unwrap();
        let cli = Cli {
            config: Some(dir.path().to_path_buf()),
            storage: None,
            verbose: false,
        };
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_cli_validation_checks_storage_path() {
        let dir = TempDir::new().unwrap();
        let cli = |storage: PathBuf| Cli {
            config: None,
            storage: Some(storage),
            verbose: false,
        };

        assert!(cli(dir.path().join("state.json")).validate().is_ok());
        assert!(cli(PathBuf::from("state.json")).validate().is_ok());

        let err = cli(dir.path().to_path_buf()).validate().unwrap_err();
        assert!(err.contains("is a directory"));

        let err = cli(dir.path().join("missing").join("state.json"))
            .validate()
            .unwrap_err();
        assert!(err.contains("does not exist"));
    }

    #[test]
    fn test_storage_path_from_config_is_checked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watchtower.toml");
        std::fs::write(
            &path,
            format!("[storage]\npath = \"{}\"\n", dir.path().display()),
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        let storage = config.storage.path.unwrap();
        assert!(check_storage_path(&storage).is_err());
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/watchtower.toml"))).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(load_config(None).unwrap(), Config::default());
    }

    #[test]
    fn test_load_config_invalid_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watchtower.toml");
        std::fs::write(&path, "[engine]\nevaluation_interval_seconds = 0\n").unwrap();

        assert!(matches!(
            load_config(Some(&path)),
            Err(ConfigError::ValidationError(_))
        ));
    }
}

use line_relay::config::{Config, ConfigError, RuntimeType};
use line_relay::error::RelayResult;
use line_relay::relay;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(ConfigError::Usage(e)) if !e.use_stderr() => e.exit(),
        Err(ConfigError::Usage(e)) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        runtime = ?config.runtime,
        max_connections = config.max_connections,
        "Starting line-relay server"
    );

    let result = match config.runtime {
        RuntimeType::Mio => run_mio(config),
        RuntimeType::Tokio => run_tokio(config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::from(1)
        }
    }
}

/// Run with mio runtime (epoll on Linux, kqueue on macOS)
fn run_mio(config: Config) -> RelayResult<()> {
    info!("Using mio runtime (epoll/kqueue)");
    relay::mio::run(config)
}

/// Run with tokio runtime (task per connection)
fn run_tokio(config: Config) -> RelayResult<()> {
    info!("Using tokio runtime (task per connection)");
    relay::tokio::run(config)
}

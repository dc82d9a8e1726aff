//! Scribed entry point.

use std::process::ExitCode;

use clap::Parser;

use scribed::{daemon, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    ExitCode::from(daemon::main_with_exit_code(cli).await)
}

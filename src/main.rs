mod audit;
mod cli;
mod config;
mod constants;
mod context;
mod error;
mod hash;
mod http;
mod logging;
mod manifest;
mod net;
mod router;
mod status;
mod transfer;
mod util;

use clap::Parser;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = cli::Cli::parse();

    let log_level = std::fs::read_to_string(&cli.config)
        .ok()
        .and_then(|text| serde_yaml::from_str::<config::KeyMeshConfig>(&text).ok())
        .map(|cfg| cfg.logging)
        .unwrap_or_default();
    let _logging_handle = logging::init(&log_level);

    match cli::run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "keymesh exited with an error");
            std::process::ExitCode::FAILURE
        }
    }
}

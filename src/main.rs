//! sluice CLI: run fetch, decode and store pipelines from YAML config.

use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use sluice::app::run_pipelines;
use sluice::config::{CliArgs, Config};
use sluice::init_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = CliArgs::parse();
    let paths = args.config_paths();
    if paths.is_empty() {
        eprintln!("Error: no config files or directories specified");
        return ExitCode::FAILURE;
    }

    info!("Loading config from {} source(s)", paths.len());
    let config = match Config::load(&paths) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", snafu::Report::from_error(e));
            return ExitCode::FAILURE;
        }
    };

    info!("Starting sluice with {} pipeline(s)", config.pipelines.len());
    for (key, pipeline) in &config.pipelines {
        info!(
            "  Pipeline: {} ({} inline item(s) -> {})",
            key,
            pipeline.source.items.len(),
            pipeline.sink.path.display()
        );
    }

    match run_pipelines(config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{}", snafu::Report::from_error(e));
            ExitCode::FAILURE
        }
    }
}

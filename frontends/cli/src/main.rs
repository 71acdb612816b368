mod runner;
mod scenario;

use anyhow::Result;
use ranksync::{telemetry, EngineConfig};
use runner::ScenarioRunner;
use scenario::Scenario;
use std::path::PathBuf;

const USAGE: &str = "usage: ranksync-cli [--config <path>] <scenario.yaml>";

#[tokio::main]
async fn main() -> Result<()> {
    // Simple argument parsing: --config <path> and one positional scenario path
    let mut args = std::env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;
    let mut scenario_path: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            match args.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => anyhow::bail!("--config needs a path\n{}", USAGE),
            }
        } else if arg == "--help" || arg == "-h" {
            println!("{}", USAGE);
            return Ok(());
        } else if !arg.starts_with('-') {
            scenario_path = Some(PathBuf::from(arg));
        } else {
            anyhow::bail!("unknown option {}\n{}", arg, USAGE);
        }
    }

    let Some(scenario_path) = scenario_path else {
        anyhow::bail!(USAGE);
    };

    // Fall back to RANKSYNC_CONFIG, then to defaults
    let config = match config_path {
        Some(path) => EngineConfig::load_from_file(&path)?,
        None => EngineConfig::from_env()?,
    };
    telemetry::init_tracing(&config.log_filter);

    let scenario = Scenario::load_from_file(&scenario_path)?;
    tracing::info!(
        playlist = %scenario.playlist,
        tracks = scenario.tracks.len(),
        steps = scenario.steps.len(),
        "running scenario"
    );

    let runner = ScenarioRunner::start(&scenario, config).await?;
    let result = runner.run(&scenario.steps).await;
    runner.finish().await;
    result
}

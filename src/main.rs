use std::fs::File;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use file_rotate::{compression::Compression, suffix::AppendCount, ContentLimit, FileRotate};

use spot_guard::config::SpotGuardConfig;
use spot_guard::sim::scenario::{print_report, run_scenario, Scenario};

/// Runs the spot guard decision core against an in-memory cluster described
/// by a scenario file. Production deployments embed the agent with real
/// cloud and Kubernetes adapters behind the same ports.
#[derive(Parser)]
#[command(name = "spot-guard", about)]
struct Args {
    /// Path to the agent configuration, YAML.
    #[arg(long)]
    config: PathBuf,

    /// Path to the scenario describing the cluster and the events to replay.
    #[arg(long)]
    scenario: PathBuf,
}

fn init_logging(config: &SpotGuardConfig) {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(logs_filepath) = &config.logs_filepath {
        let log_file = FileRotate::new(
            logs_filepath,
            AppendCount::new(5),
            ContentLimit::Bytes(10 * 1024 * 1024),
            Compression::None,
            #[cfg(unix)]
            None,
        );
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_file = File::open(&args.config)
        .with_context(|| format!("opening config {}", args.config.display()))?;
    let config: SpotGuardConfig =
        serde_yaml::from_reader(config_file).context("parsing agent config")?;
    config.validate().context("validating agent config")?;

    init_logging(&config);

    let scenario_file = File::open(&args.scenario)
        .with_context(|| format!("opening scenario {}", args.scenario.display()))?;
    let scenario: Scenario =
        serde_yaml::from_reader(scenario_file).context("parsing scenario")?;

    let report = run_scenario(&config, &scenario).await;
    print_report(&report);
    Ok(())
}

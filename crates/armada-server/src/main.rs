use anyhow::Result;
use clap::Parser;

use armada_core::config::ArmadaConfig;
use armada_server::bootstrap::ServerBootstrapper;

#[derive(Parser)]
#[command(name = "armada-server")]
#[command(about = "Armada Server - agent fleet control plane")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = ArmadaConfig::load_config(args.config.as_deref())?;
    armada_core::telemetry::init_tracing_with(&cfg.log_config());

    if let Some(path) = args.config.as_deref() {
        tracing::info!("Loaded config file: {}", path);
    } else {
        tracing::info!("Config: using default search (current dir)");
    }
    tracing::info!("Effective broadcast transport: {:?}", cfg.broadcast.transport);
    tracing::info!("Rollout interval: {}ms", cfg.scheduler.rollout_interval_ms);

    let running_server = ServerBootstrapper::new(cfg).start().await?;
    running_server.wait_for_shutdown().await
}

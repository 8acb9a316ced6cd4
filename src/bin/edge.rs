//! Edge agent daemon: collects host telemetry and ships it to the
//! Central Brain. Optional argument: path to a YAML configuration file.

use sidra_telemetry::config::EdgeConfig;
use sidra_telemetry::edge_agent::EdgeAgent;
use sidra_telemetry::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_path = std::env::args().nth(1);
    let config = EdgeConfig::load(config_path.as_deref())?;

    let _log_guard = logging::init(&config.log_level, config.log_file.as_deref())?;

    let agent = EdgeAgent::new(config)?;
    agent.run().await?;
    Ok(())
}

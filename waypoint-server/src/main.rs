use waypoint::EngineConfig;
use waypoint_server::{init_tracing, run_server, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ServerConfig::from_env()?;
    let engine = EngineConfig::from_env()?;
    run_server(config, engine).await
}

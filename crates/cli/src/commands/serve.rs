//! `turnkeep serve`: start the HTTP gateway.

use super::runtime::{build_engine, load_config};

pub async fn run(port_override: Option<u16>) -> anyhow::Result<()> {
    let mut config = load_config()?;
    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("turnkeep gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Store:     {}", config.store.backend);

    let engine = build_engine(config).await?;
    turnkeep_gateway::start(engine)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

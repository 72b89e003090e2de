//! skye-relay - Signaling-Relay für Familienanrufe

use anyhow::Context;
use skye::config::RelayConfig;
use skye::relay::RelayServer;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("skye=debug".parse()?)
                .add_directive("tungstenite=warn".parse()?),
        )
        .init();

    let config = RelayConfig::from_env();
    let server = Arc::new(RelayServer::new(config));

    let listener = server.bind().await.context("binding relay listener")?;
    let addr = listener.local_addr().context("reading listener address")?;
    tracing::info!("SKYE relay listening on {}", addr);

    server.run(listener).await;
    Ok(())
}

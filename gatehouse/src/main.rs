use std::sync::Arc;

use gatehouse::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize tracing
    init_tracing(&config);

    tracing::info!(
        service = %config.service.name,
        port = config.service.port,
        connectors = config.connectors.len(),
        "starting gateway"
    );

    // Usage records append to the configured JSONL log
    let sink = Arc::new(JsonlUsageSink::new(config.usage.log_path.clone()));

    // Build application state (catalog, auth, secrets, cache, policy,
    // upstream client, usage buffer)
    let state = AppState::from_config(config)?;

    // Run server with graceful shutdown; the usage buffer drains before
    // exit
    Server::new(state).serve(sink).await?;

    Ok(())
}

use std::sync::Arc;

use nutrik_core::config::Config;
use nutrik_core::proxy::{ChatServer, ChatService};

pub async fn run(mut config: Config, port_override: Option<u16>) -> anyhow::Result<()> {
    // Apply port override if provided
    if let Some(port) = port_override {
        config.server.port = port;
    }

    let chat = Arc::new(ChatService::from_config(&config)?);
    let candidates = chat.candidates();

    tracing::info!("Starting Nutrik server...");
    tracing::info!("  Port: {}", config.server.port);
    tracing::info!("  Host: {}", config.server.get_bind_address());
    tracing::info!("  API version: {}", config.upstream.api_version.path_segment());
    tracing::info!("  Candidate models: {}", candidates.models().join(", "));

    if config.upstream.api_key.is_empty() {
        tracing::warn!("No API key configured. Set GEMINI_API_KEY or upstream.api_key.");
        tracing::warn!("The server will start but chat requests will fail upstream.");
    }
    if candidates.is_empty() {
        tracing::warn!("No candidate models configured; every chat request will fail.");
    }

    let server = ChatServer::new(&config, chat);

    tracing::info!(
        "Chat server starting on http://{}:{}",
        config.server.get_bind_address(),
        config.server.port
    );
    tracing::info!("Press Ctrl+C to stop");

    // Run server (blocks until shutdown)
    server.run().await?;

    Ok(())
}

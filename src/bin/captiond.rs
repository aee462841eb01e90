//! Caption Pipeline Daemon
//!
//! Hosts the full pipeline: speaker audio ingest over WebSocket,
//! per-speaker recognition, translation fan-out, and listener caption
//! delivery.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use polyglot_captions::api::ApiServer;
use polyglot_captions::config::CaptionConfig;
use polyglot_captions::CaptionPipeline;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Polyglot Captions daemon");

    // Optional config path as the first argument
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = CaptionConfig::load_or_default(config_path.as_deref())?;

    tracing::info!(
        "Recognizers: {:?}, translation endpoint: {}",
        config.recognition.servers,
        config.translation.endpoint
    );

    let api_config = config.api.clone();
    let pipeline = Arc::new(CaptionPipeline::new(config)?);

    let mut server = ApiServer::new(api_config.clone(), pipeline.clone());
    let _server_handle = server.start_background();

    tracing::info!(
        "API available at http://{}:{}",
        api_config.bind_address,
        api_config.http_port
    );
    tracing::info!(
        "Speakers: ws://{}:{}/ws/speak, listeners: ws://{}:{}/ws/captions",
        api_config.bind_address,
        api_config.http_port,
        api_config.bind_address,
        api_config.http_port
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    server.stop();
    pipeline.shutdown();

    Ok(())
}

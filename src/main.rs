//! wirebus - packet protocol server daemon
//!
//! Binds the wirebus TCP server with the built-in system processor.

use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wirebus_core::{CoreError, DispatchContext, Processor, ProcessorRegistry};
use wirebus_protocol::Payload;
use wirebus_server::{Config, Server, ServerConfig};

/// Built-in system processor: liveness echo and server identification.
struct SystemProcessor;

impl Processor for SystemProcessor {
    fn identifier(&self) -> &str {
        "sys"
    }

    fn handle(
        &self,
        _ctx: &DispatchContext,
        _request_id: &str,
        method: &str,
        payload: &Payload,
    ) -> Result<Option<Payload>, CoreError> {
        match method {
            "ping" => Ok(Some(payload.clone())),
            "info" => Ok(Some(Payload::Value(json!({
                "server": "wirebus",
                "version": env!("CARGO_PKG_VERSION"),
            })))),
            other => Err(CoreError::Handler(format!("unknown method '{}'", other))),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if WIREBUS_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("WIREBUS_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // An explicitly named config file must load; defaults only
            // cover the unset case.
            if std::env::var("WIREBUS_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting wirebus server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Pool: {} workers, shard capacity {}, assured={}",
        config.pool.workers,
        config.pool.shard_capacity,
        config.pool.assured
    );
    if config.codec.compression {
        tracing::info!(
            "  Compression enabled (min {} bytes)",
            config.codec.min_compress_len
        );
    }

    let mut processors = ProcessorRegistry::new();
    processors.register(Arc::new(SystemProcessor));

    let server = Server::new(ServerConfig::from_settings(&config), Arc::new(processors));

    // Graceful shutdown on ctrl-c
    let shutdown_ref = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            shutdown_ref.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}

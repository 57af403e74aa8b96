//! meshgated — meshgate HTTP bridge daemon.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use meshgate_core::config::ConfigError;
use meshgate_core::{Identity, MeshgateConfig, Schema};
use meshgate_services::{
    BridgeServer, ClientOptions, Directory, DrainOptions, HttpDirectory, HttpUpstream,
    MemoryDirectory, Publisher, PublisherConfig, StreamConfig, StreamTable, TcpQueryListener,
};

mod proxy;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = MeshgateConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = match MeshgateConfig::load() {
        Ok(config) => config,
        Err(e @ ConfigError::Invalid(_)) => return Err(e).context("refusing to start"),
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            MeshgateConfig::default()
        }
    };

    // Identity
    let identity = Identity::load_or_generate(&config.identity.seed_path)
        .context("failed to load node identity")?;
    tracing::info!(address = %identity.address, "meshgated starting");

    let schema = Arc::new(Schema::standard());
    let started_at = Instant::now();

    // ── Shutdown ─────────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    // ── Directory ────────────────────────────────────────────────────────────
    let local_directory = MemoryDirectory::new();
    let directory: Arc<dyn Directory> = if config.discovery.directory_url.is_empty() {
        tracing::info!("using in-process directory");
        Arc::new(local_directory.clone())
    } else {
        tracing::info!(url = %config.discovery.directory_url, "using HTTP directory");
        Arc::new(
            HttpDirectory::new(&config.discovery.directory_url, config.discovery.attempt_timeout())
                .context("failed to build directory client")?,
        )
    };

    if config.discovery.serve_port != 0 {
        let dir = local_directory.clone();
        let port = config.discovery.serve_port;
        tokio::spawn(async move {
            if let Err(e) = meshgate_api::serve_directory(dir, port).await {
                tracing::error!(error = %e, "directory server failed");
            }
        });
    }

    // ── Bridge server ────────────────────────────────────────────────────────
    let server = if config.server.enabled {
        let upstream = HttpUpstream::new(&config.server.origin_url, config.server.upstream_timeout())
            .context("invalid origin URL")?;
        let streams = StreamTable::new(StreamConfig {
            chunk_ceiling: config.streams.chunk_ceiling,
            idle_timeout: config.streams.idle_timeout(),
            stall_timeout: config.streams.stall_timeout(),
        });
        streams.spawn_sweeper(config.streams.sweep_interval(), shutdown.child_token());

        let server = BridgeServer::new(
            schema.clone(),
            Arc::new(upstream),
            streams,
            config.server.upstream_timeout(),
        );

        let listener = TcpQueryListener::bind(&config.transport.listen_addr, Arc::new(server.clone()))
            .await
            .with_context(|| format!("failed to bind {}", config.transport.listen_addr))?;
        let bound = listener.local_addr()?;
        tracing::info!(
            addr = %bound,
            origin = %config.server.origin_url,
            "bridging origin"
        );
        tokio::spawn(listener.run(shutdown.child_token()));

        // Publish where this node can be reached.
        let endpoint = if config.discovery.endpoint.is_empty() {
            if bound.ip().is_unspecified() {
                tracing::warn!(
                    addr = %bound,
                    "advertising an unspecified address; set discovery.endpoint"
                );
            }
            bound.to_string()
        } else {
            config.discovery.endpoint.clone()
        };
        Publisher::new(
            directory.clone(),
            identity.address,
            endpoint,
            PublisherConfig {
                interval: config.discovery.publish_interval(),
                validity: config.discovery.validity(),
                retry_backoff: config.discovery.retry_backoff(),
                max_attempts: config.discovery.max_attempts,
                attempt_timeout: config.discovery.attempt_timeout(),
            },
        )
        .spawn(shutdown.child_token());

        Some(server)
    } else {
        tracing::info!("server disabled, client only");
        None
    };

    // ── Proxy front-end ──────────────────────────────────────────────────────
    if config.proxy.enabled {
        let opts = ClientOptions {
            request_timeout: config.server.upstream_timeout() + config.client.query_timeout(),
            drain: DrainOptions {
                max_chunk: config.client.max_chunk_size,
                retries: config.client.retries,
                retry_backoff: config.client.retry_backoff(),
                query_timeout: config.client.query_timeout(),
            },
        };
        let state = proxy::ProxyState::new(schema.clone(), directory.clone(), opts);
        let port = config.proxy.listen_port;
        let token = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = proxy::serve(state, port, token).await {
                tracing::error!(error = %e, "proxy failed");
            }
        });
    }

    // ── Control API ──────────────────────────────────────────────────────────
    if config.api.port != 0 {
        let state = meshgate_api::ApiState {
            address: identity.address,
            schema: schema.clone(),
            server: server.clone(),
            started_at,
            shutdown: shutdown.clone(),
        };
        let port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) = meshgate_api::serve(state, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────
    shutdown.cancelled().await;
    tracing::info!("shutting down");
    Ok(())
}

use crate::config::Config;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

mod enforce;
pub mod extract;
mod http;
pub mod metrics;
pub mod prom;
mod response;
mod routes;
mod rules;
mod silences;
mod upstream;

use extract::Extractor;
use prom::ProxyMetrics;
use upstream::Upstream;

/// Idle timeout for keep-alive client connections.
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum concurrent client connections.
const MAX_CONNECTIONS: usize = 1000;

/// Shared state for all proxy connections. Immutable after startup except
/// for the metrics counters.
pub struct ProxyState {
    pub cfg: Config,
    pub extractor: Extractor,
    pub upstream: Upstream,
    pub passthrough: HashSet<String>,
    pub metrics: ProxyMetrics,
}

pub async fn run(cfg: Config) -> Result<()> {
    let upstream = Upstream::new(&cfg.upstream, cfg.insecure_skip_verify)
        .context("failed to set up upstream transport")?;

    let passthrough =
        routes::validate_passthrough_paths(&cfg.passthrough_paths, cfg.enable_label_apis)?;
    if !passthrough.is_empty() {
        debug!(paths = passthrough.len(), "passthrough paths configured");
    }

    let extractor = cfg.extractor();
    let proxy_metrics = ProxyMetrics::register(prometheus::Registry::new());

    // Spawn the internal metrics server if configured.
    if let Some(ref listen) = cfg.internal_listen_address {
        let _internal_handle = metrics::spawn(listen, proxy_metrics.clone()).await?;
        info!(addr = %listen, "internal server started");
    }

    let listen_address = cfg.listen_address.clone();
    let state = Arc::new(ProxyState {
        cfg,
        extractor,
        upstream,
        passthrough,
        metrics: proxy_metrics,
    });

    // Connection limit semaphore.
    let connection_limit = Arc::new(Semaphore::new(MAX_CONNECTIONS));

    let listener = TcpListener::bind(&listen_address)
        .await
        .with_context(|| format!("failed to listen on {}", listen_address))?;
    info!(addr = %listen_address, "listening insecurely");

    let server_span = info_span!(
        "server",
        service.name = "prom-label-proxy",
        server.address = %listen_address,
    );
    let _server_guard = server_span.enter();

    // Setup graceful shutdown.
    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate())?;
    let shutdown = async {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            info!("received shutdown signal");
        }
    };
    tokio::pin!(shutdown);

    // Accept connections until shutdown.
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("server shutting down gracefully");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let permit = match connection_limit.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                warn!(addr = %addr, "connection limit reached, waiting");
                                match tokio::time::timeout(
                                    Duration::from_secs(5),
                                    connection_limit.clone().acquire_owned(),
                                )
                                .await
                                {
                                    Ok(Ok(permit)) => permit,
                                    _ => {
                                        warn!(addr = %addr, "connection rejected: limit exceeded");
                                        drop(stream);
                                        continue;
                                    }
                                }
                            }
                        };

                        let state = Arc::clone(&state);
                        let span = info_span!("conn", %addr);
                        tokio::spawn(
                            async move {
                                // Permit is held for the duration of the connection.
                                let _permit = permit;
                                let _conn_guard = prom::ConnectionGuard::new(&state.metrics);
                                if let Err(e) = http::handle_connection(stream, state).await {
                                    let msg = e.to_string();
                                    if msg.contains("Connection reset") || msg.contains("broken pipe") {
                                        debug!(error = %e, "connection closed by peer");
                                    } else {
                                        error!(error = %e, "connection error");
                                    }
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "accept error");
                    }
                }
            }
        }
    }

    Ok(())
}

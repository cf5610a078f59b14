use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;

use tunnel_broker::{
    broker::TunnelBroker,
    config::Config,
    events::{init_logging, EventEmitter},
    server::tunnel_router,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_logging(&cfg)?;

    let events = EventEmitter::new(cfg.json_output);
    let broker = TunnelBroker::new(cfg.broker_settings(), events.clone());
    let router = tunnel_router(broker.clone(), cfg.resolved_api_key());

    let addr = cfg.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind tunnel broker on {addr}"))?;
    tracing::info!(
        addr = %addr,
        expected_sockets = cfg.expected_sockets,
        forward_timeout_ms = ?cfg.forward_timeout_ms,
        "tunnel broker listening"
    );

    // Requests are accepted before the peer finished connecting; they queue
    // until sockets register. This only reports readiness.
    tokio::spawn({
        let broker = broker.clone();
        let ready_timeout = cfg.ready_timeout();
        async move {
            match broker.wait_until_ready(ready_timeout).await {
                Ok(()) => {
                    let stats = broker.stats();
                    tracing::info!(
                        registered = stats.registered_sockets,
                        "all tunnel sockets registered"
                    );
                    events.emit(
                        "tunnel_ready",
                        json!({ "registered": stats.registered_sockets }),
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        error = %error,
                        registered = broker.stats().registered_sockets,
                        "tunnel sockets not ready"
                    );
                }
            }
        }
    });

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(broker))
        .await
        .context("tunnel broker server failed")?;
    Ok(())
}

async fn shutdown_signal(broker: TunnelBroker) {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(error) => {
                    tracing::warn!(error = %error, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    broker.shutdown();
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    broker.shutdown();
}

mod cli;
mod config;
mod rtc;
mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use inference_proxy::{ModelManager, OllamaClient, StreamingProxy, TtftMetrics};
use local_guard::AdmissionGate;
use peer_session::{PeerRegistry, SessionContext};
use secure_channel::SecureChannelManager;

use crate::cli::Cli;
use crate::rtc::WebRtcEngine;
use crate::server::{AppState, LocalOnlyListener};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI and environment overrides.
    let mut cfg = config::load(&cli.config)?;
    cli.apply(&mut cfg);

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!(
        config_file = %cli.config.display(),
        listen = %cfg.network.listen_addr,
        backend = %cfg.backend.url,
        "quicpair-gateway starting"
    );

    // 4. Admission gate. A non-local backend is refused outright.
    let gate = AdmissionGate::new(cfg.network.strict_local);
    gate.admit_url(&cfg.backend.url)
        .context("backend URL rejected by strict local mode")?;

    // 5. Secure channel key.
    let secure = SecureChannelManager::new();
    #[cfg(debug_assertions)]
    let secure = secure.with_plaintext_mode(cfg.dev.plaintext_allowed());
    let secure = Arc::new(secure);
    info!(public_key = %secure.public_key_base64(), "noise static key ready");

    // 6. Backend client, model lifecycle and the streaming proxy.
    let client = OllamaClient::new(cfg.backend.url.clone())
        .context("failed to build backend HTTP client")?;
    let models = Arc::new(ModelManager::new(client.clone()));
    let proxy = Arc::new(StreamingProxy::new(
        client,
        Arc::clone(&models),
        Arc::new(TtftMetrics::new()),
        cfg.backend.tiers.clone(),
        cfg.backend.default_model.clone(),
    ));

    // Startup warmup runs in the background.
    let _warmup = models.warmup_all(cfg.backend.warmup_models.clone());

    // 7. Set up shutdown signal (ctrl_c + SIGTERM).
    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    // 8. Transport engine and per-peer context.
    let engine = WebRtcEngine::new(&cfg.rtc).context("failed to initialise WebRTC engine")?;
    let registry = Arc::new(PeerRegistry::new());
    let sessions = Arc::new(SessionContext {
        secure,
        proxy,
        registry: Arc::clone(&registry),
        shutdown: shutdown.clone(),
    });

    let app = server::router(AppState {
        gate,
        engine: Arc::new(engine),
        sessions,
    });

    // 9. Serve until shutdown.
    let listener = tokio::net::TcpListener::bind(&cfg.network.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.network.listen_addr))?;
    info!(listen = %cfg.network.listen_addr, "http server listening");

    let signal = shutdown.clone();
    axum::serve(LocalOnlyListener::new(listener, gate), app)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await
        .context("http server failed")?;

    // 10. Tear down peers and keep-alives.
    shutdown.cancel();
    registry.cancel_all();
    models.shutdown();
    info!(peers = registry.len(), "quicpair-gateway shutting down");

    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {
                        info!("received SIGINT (ctrl-c)");
                    }
                    _ = sigterm.recv() => {
                        info!("received SIGTERM");
                    }
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler; only ctrl-c stops the gateway");
                ctrl_c.await.ok();
                info!("received SIGINT (ctrl-c)");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT (ctrl-c)");
    }

    shutdown.cancel();
}

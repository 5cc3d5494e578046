use std::sync::Arc;

use tracing::info;

use parley::config::EngineConfig;
use parley::engine::Engine;
use parley::notify::{NotifyHub, Recipient};
use parley::sweep;
use parley::time::SystemClock;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = EngineConfig::from_env();
    parley::observability::init(config.metrics_port)?;

    let hub = Arc::new(NotifyHub::new());
    let mut provider_feed = hub.subscribe(Recipient::Provider);
    let engine = Arc::new(Engine::open(config.clone(), Arc::new(SystemClock), hub.clone())?);

    info!("parley engine started");
    info!(
        "  journal: {}",
        config
            .journal_path()
            .map_or("disabled (in-memory)".to_string(), |p| p.display().to_string())
    );
    info!("  negotiation timeout: {}s", config.negotiation_timeout_ms / 1000);
    info!("  sweep interval: {:?}", config.sweep_interval);
    info!("  max rounds: {}", config.max_rounds);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    tokio::spawn(sweep::run_sweeper(engine.clone(), config.sweep_interval));
    if config.data_dir.is_some() {
        tokio::spawn(sweep::run_compactor(
            engine.clone(),
            config.compact_threshold,
            config.compact_interval,
        ));
    }

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("no SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    // Front-ends embed the engine; the daemon itself just logs what the provider would see.
    loop {
        tokio::select! {
            received = provider_feed.recv() => match received {
                Ok(n) => info!(notification = %serde_json::to_string(&n)?, "provider notification"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("provider feed lagged, {skipped} notifications dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    if let Err(e) = engine.compact_journal().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("parley stopped");
    Ok(())
}

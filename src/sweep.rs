use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Expire every request whose negotiation deadline has passed. Safe to
/// re-run: each expiry goes through the normal locked transition and
/// requests that moved on in the meantime are skipped.
pub async fn sweep_once(engine: &Engine) -> usize {
    let now = engine.now();
    let due = engine.collect_expired(now);
    if due.is_empty() {
        return 0;
    }
    let results = join_all(due.iter().map(|id| engine.expire_request(*id))).await;
    let mut expired = 0;
    for (id, result) in due.iter().zip(results) {
        match result {
            Ok(true) => expired += 1,
            Ok(false) => debug!("sweep skip {id}: no longer due"),
            Err(e) => debug!("sweep skip {id}: {e}"),
        }
    }
    if expired > 0 {
        info!("sweep expired {expired} request(s)");
    }
    expired
}

/// Background task that periodically expires stalled negotiations.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_once(&engine).await;
    }
}

/// Background task that compacts the journal once enough records pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = engine.journal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_journal().await {
            Ok(()) => info!("journal compacted after {appends} appends"),
            Err(e) => warn!("journal compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::time::{HOUR, ManualClock};

    #[tokio::test]
    async fn sweep_expires_only_due_requests() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = Engine::open(
            EngineConfig::default(),
            clock.clone(),
            Arc::new(NotifyHub::new()),
        )
        .unwrap();

        let slot = engine
            .declare_slot(Span::new(48 * HOUR, 49 * HOUR), Modality::Online)
            .await
            .unwrap();
        let id = engine
            .submit_request(Submission {
                client: "c".into(),
                session_type: SessionType::Individual,
                modality: Modality::Online,
                desired: Span::new(48 * HOUR, 49 * HOUR),
                description: String::new(),
                contact: None,
            })
            .await
            .unwrap();

        clock.set(24 * HOUR - 1);
        assert_eq!(sweep_once(&engine).await, 0);

        clock.set(24 * HOUR);
        assert_eq!(sweep_once(&engine).await, 1);
        assert_eq!(
            engine.get_request(id).await.unwrap().status,
            RequestStatus::Expired
        );
        assert!(engine.get_slot(slot.id).await.unwrap().status.is_open());

        // Idempotent.
        assert_eq!(sweep_once(&engine).await, 0);
    }
}

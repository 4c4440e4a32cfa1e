use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const REAPER_INTERVAL: Duration = Duration::from_secs(5);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that expires payment authorizations nobody confirmed.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(REAPER_INTERVAL);
    loop {
        interval.tick().await;
        let expired = engine.expire_stale_authorizations(engine.now()).await;
        if expired > 0 {
            info!("reaped {expired} stale authorizations");
        }
    }
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!(appends, threshold, "compaction not due");
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FixedClock};
    use crate::config::EngineConfig;
    use crate::engine::{Collaborators, NewBooking, QuoteInput, QuoteResponse};
    use crate::gateway::SandboxGateway;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bookd_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn engine(path: PathBuf, clock: &FixedClock) -> Arc<Engine> {
        let deps = Collaborators {
            gateway: Arc::new(SandboxGateway::new()),
            notifier: Arc::new(NotifyHub::new()),
            clock: Arc::new(clock.clone()),
        };
        Arc::new(Engine::new(path, EngineConfig::default(), deps).unwrap())
    }

    async fn pending_booking(engine: &Engine) -> Ulid {
        let customer = Ulid::new();
        let professional = Ulid::new();
        let id = Ulid::new();
        engine
            .create_booking(
                Actor::Customer(customer),
                NewBooking {
                    id,
                    professional_id: professional,
                    project_id: None,
                    subproject_index: None,
                    rfq: RfqData {
                        service_type: "plumbing".into(),
                        description: "leaking tap".into(),
                        desired_start: None,
                        budget: None,
                    },
                },
            )
            .await
            .unwrap();
        engine
            .submit_quote(
                id,
                Actor::Professional(professional),
                QuoteInput {
                    amount_cents: 9_000,
                    currency: "EUR".into(),
                    description: "washer replacement".into(),
                    breakdown: vec![],
                },
            )
            .await
            .unwrap();
        engine
            .respond_to_quote(id, Actor::Customer(customer), QuoteResponse::Accept { start: None })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn reaper_expires_after_ttl() {
        let clock = FixedClock::new(1_750_000_000_000);
        let engine = engine(test_wal_path("reaper_ttl.wal"), &clock);
        let booking = pending_booking(&engine).await;

        clock.advance(engine.config.authorization_ttl_ms - 1);
        assert_eq!(engine.expire_stale_authorizations(clock.now_ms()).await, 0);

        clock.advance(1);
        assert_eq!(engine.expire_stale_authorizations(clock.now_ms()).await, 1);
        let b = engine.get_booking(booking).await.unwrap();
        assert_eq!(b.status, BookingStatus::Cancelled);
        let payment = engine.payment_for_booking(booking).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Expired);
    }

    #[tokio::test]
    async fn reaper_leaves_disputes_alone() {
        let clock = FixedClock::new(1_750_000_000_000);
        let engine = engine(test_wal_path("reaper_dispute.wal"), &clock);
        let booking = pending_booking(&engine).await;
        {
            let shared = engine.bookings.get(&booking).unwrap().value().clone();
            shared.lock().await.status = BookingStatus::Dispute;
        }

        clock.advance(engine.config.authorization_ttl_ms * 2);
        assert_eq!(engine.expire_stale_authorizations(clock.now_ms()).await, 0);
        let payment = engine.payment_for_booking(booking).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn compaction_waits_for_threshold() {
        let clock = FixedClock::new(1_750_000_000_000);
        let engine = engine(test_wal_path("reaper_compact.wal"), &clock);
        pending_booking(&engine).await;
        let appends = engine.wal_appends_since_compact().await;
        assert!(appends > 0);

        assert!(!compact_if_due(&engine, appends + 1).await);
        assert_eq!(engine.wal_appends_since_compact().await, appends);

        assert!(compact_if_due(&engine, appends).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}

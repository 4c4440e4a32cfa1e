//! Clock abstraction so proposal lead times and payment expiry are testable.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::model::Ms;

pub trait Clock: Send + Sync {
    /// Current Unix time in milliseconds.
    fn now_ms(&self) -> Ms;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as Ms)
            .unwrap_or(0)
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug, Clone)]
pub struct FixedClock {
    current: Arc<AtomicI64>,
}

impl FixedClock {
    pub fn new(now: Ms) -> Self {
        Self {
            current: Arc::new(AtomicI64::new(now)),
        }
    }

    pub fn set(&self, now: Ms) {
        self.current.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.current.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> Ms {
        self.current.load(Ordering::SeqCst)
    }
}

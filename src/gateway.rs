use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("gateway timed out")]
    Timeout,
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("unknown gateway reference: {0}")]
    UnknownReference(String),
}

impl GatewayError {
    /// Only transport-level failures may be retried. A decline is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Timeout | GatewayError::Unavailable(_))
    }
}

/// Escrow provider. The payment id is passed on every call as the
/// idempotency key.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Request a hold. Returns the provider reference; the hold is confirmed
    /// later through the payment callback.
    async fn authorize(
        &self,
        payment_id: Ulid,
        amount_cents: u64,
        currency: &str,
    ) -> Result<String, GatewayError>;

    async fn capture(
        &self,
        payment_id: Ulid,
        reference: &str,
        amount_cents: u64,
    ) -> Result<(), GatewayError>;

    /// Refund a captured payment or release an uncaptured hold.
    async fn refund(
        &self,
        payment_id: Ulid,
        reference: &str,
        amount_cents: u64,
    ) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Authorize { payment_id: Ulid, amount_cents: u64 },
    Capture { payment_id: Ulid, amount_cents: u64 },
    Refund { payment_id: Ulid, amount_cents: u64 },
}

#[derive(Default)]
struct SandboxState {
    calls: Vec<GatewayCall>,
    authorize_failures: VecDeque<GatewayError>,
    capture_failures: VecDeque<GatewayError>,
    refund_failures: VecDeque<GatewayError>,
    /// Successful captures per payment.
    captured: HashMap<Ulid, u32>,
}

/// In-process gateway that records every call and fails on demand.
#[derive(Default)]
pub struct SandboxGateway {
    state: Mutex<SandboxState>,
    references: AtomicU64,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_next_authorize(&self, err: GatewayError) {
        self.state.lock().await.authorize_failures.push_back(err);
    }

    pub async fn fail_next_capture(&self, err: GatewayError) {
        self.state.lock().await.capture_failures.push_back(err);
    }

    pub async fn fail_next_refund(&self, err: GatewayError) {
        self.state.lock().await.refund_failures.push_back(err);
    }

    pub async fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn capture_count(&self, payment_id: Ulid) -> u32 {
        self.state
            .lock()
            .await
            .captured
            .get(&payment_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn authorize(
        &self,
        payment_id: Ulid,
        amount_cents: u64,
        _currency: &str,
    ) -> Result<String, GatewayError> {
        let mut state = self.state.lock().await;
        state.calls.push(GatewayCall::Authorize {
            payment_id,
            amount_cents,
        });
        if let Some(err) = state.authorize_failures.pop_front() {
            return Err(err);
        }
        let n = self.references.fetch_add(1, Ordering::Relaxed);
        Ok(format!("sandbox_{payment_id}_{n}"))
    }

    async fn capture(
        &self,
        payment_id: Ulid,
        _reference: &str,
        amount_cents: u64,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        state.calls.push(GatewayCall::Capture {
            payment_id,
            amount_cents,
        });
        if let Some(err) = state.capture_failures.pop_front() {
            return Err(err);
        }
        *state.captured.entry(payment_id).or_default() += 1;
        Ok(())
    }

    async fn refund(
        &self,
        payment_id: Ulid,
        _reference: &str,
        amount_cents: u64,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        state.calls.push(GatewayCall::Refund {
            payment_id,
            amount_cents,
        });
        if let Some(err) = state.refund_failures.pop_front() {
            return Err(err);
        }
        Ok(())
    }
}

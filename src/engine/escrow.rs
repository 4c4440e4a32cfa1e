//! Escrow coordination: payment compare-and-set, gateway callbacks, capture
//! with retry, refunds and authorization expiry.

use std::time::Duration;

use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::lifecycle::payment_edge_allowed;
use crate::limits::{MAX_CAPTURE_ATTEMPTS, MAX_CAPTURE_BACKOFF_MS};
use crate::model::*;
use crate::notify::NotificationKind;

use super::conflict::validate_instant;
use super::transitions::advance;
use super::{Engine, EngineError};

/// What the gateway reports about an authorization request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Authorized { reference: String },
    Declined { reason: String },
}

impl Engine {
    /// Compare-and-set on a payment. `mutate` runs only if the payment is in
    /// `expected`; the result must follow a legal payment edge. The new state
    /// is logged to the WAL and reverted in memory if that fails.
    pub(super) async fn cas_payment(
        &self,
        id: Ulid,
        expected: PaymentStatus,
        mutate: impl FnOnce(&mut Payment) -> Result<(), EngineError>,
    ) -> Result<Payment, EngineError> {
        let now = self.now();
        let (previous, next) = {
            let mut entry = self.payments.get_mut(&id).ok_or(EngineError::NotFound(id))?;
            if entry.status != expected {
                return Err(EngineError::PaymentState {
                    payment: id,
                    expected,
                    actual: entry.status,
                });
            }
            let previous = entry.clone();
            let mut next = previous.clone();
            mutate(&mut next)?;
            if next.status != previous.status && !payment_edge_allowed(previous.status, next.status) {
                return Err(EngineError::PaymentState {
                    payment: id,
                    expected: next.status,
                    actual: previous.status,
                });
            }
            next.updated_at = now;
            *entry = next.clone();
            (previous, next)
        };

        if let Err(e) = self
            .wal_append(&Event::PaymentWritten {
                payment: next.clone(),
            })
            .await
        {
            if let Some(mut entry) = self.payments.get_mut(&id)
                && *entry == next
            {
                *entry = previous;
            }
            return Err(e);
        }
        Ok(next)
    }

    pub(super) async fn insert_payment(&self, payment: Payment) -> Result<(), EngineError> {
        if self.payments.contains_key(&payment.id) {
            return Err(EngineError::AlreadyExists(payment.id));
        }
        self.wal_append(&Event::PaymentWritten {
            payment: payment.clone(),
        })
        .await?;
        self.payments.insert(payment.id, payment);
        Ok(())
    }

    fn booking_payment(&self, booking: &Booking) -> Result<Payment, EngineError> {
        let id = booking
            .payment_id
            .ok_or_else(|| EngineError::validation("payment", "booking has no payment"))?;
        self.get_payment(id)
    }

    /// The booking's payment, which must hold an authorized escrow.
    pub(super) fn require_authorized(&self, booking: &Booking) -> Result<Payment, EngineError> {
        let payment = self.booking_payment(booking)?;
        if payment.status != PaymentStatus::Authorized {
            return Err(EngineError::PaymentState {
                payment: payment.id,
                expected: PaymentStatus::Authorized,
                actual: payment.status,
            });
        }
        Ok(payment)
    }

    fn reference_of(payment: &Payment) -> Result<&str, EngineError> {
        payment
            .gateway_reference
            .as_deref()
            .ok_or_else(|| EngineError::PaymentFailure(format!("payment {} has no gateway reference", payment.id)))
    }

    /// Gateway report for the booking's pending authorization. On success the
    /// schedule is committed right away; a `Conflict` leaves the payment
    /// authorized and the booking waiting for `confirm_booking`.
    pub async fn payment_callback(
        &self,
        booking_id: Ulid,
        actor: Actor,
        outcome: PaymentOutcome,
    ) -> Result<Booking, EngineError> {
        if !matches!(actor, Actor::Gateway | Actor::Admin) {
            return Err(EngineError::Forbidden {
                role: actor.role(),
                action: "report payment outcomes".into(),
            });
        }
        let shared = self.require_booking(&booking_id)?;
        let mut current = shared.lock().await;
        let payment = self.booking_payment(&current)?;

        match outcome {
            PaymentOutcome::Declined { reason } => {
                if payment.status == PaymentStatus::Failed {
                    return Ok(current.clone());
                }
                self.cas_payment(payment.id, PaymentStatus::Pending, |p| {
                    p.status = PaymentStatus::Failed;
                    Ok(())
                })
                .await?;
                info!(booking = %booking_id, payment = %payment.id, %reason, "authorization declined");
                self.notify_after_write(&current, &actor, NotificationKind::PaymentFailed)
                    .await;
                Ok(current.clone())
            }
            PaymentOutcome::Authorized { reference } => match payment.status {
                PaymentStatus::Expired => {
                    warn!(
                        booking = %booking_id,
                        payment = %payment.id,
                        "authorization arrived after expiry, releasing hold"
                    );
                    self.gateway
                        .refund(payment.id, &reference, payment.amount_cents)
                        .await
                        .map_err(|e| {
                            error!(payment = %payment.id, "late hold release failed: {e}");
                            EngineError::PaymentFailure(e.to_string())
                        })?;
                    self.cas_payment(payment.id, PaymentStatus::Expired, |p| {
                        p.status = PaymentStatus::Refunded;
                        p.gateway_reference = Some(reference);
                        p.refunded_cents = p.amount_cents;
                        Ok(())
                    })
                    .await?;
                    Ok(current.clone())
                }
                PaymentStatus::Pending | PaymentStatus::Authorized => {
                    if payment.status == PaymentStatus::Pending {
                        self.cas_payment(payment.id, PaymentStatus::Pending, |p| {
                            p.status = PaymentStatus::Authorized;
                            p.gateway_reference = Some(reference);
                            Ok(())
                        })
                        .await?;
                        info!(booking = %booking_id, payment = %payment.id, "escrow authorized");
                    }
                    if current.status != BookingStatus::PaymentPending {
                        return Ok(current.clone());
                    }
                    self.authorize_edge(&current, BookingStatus::Booked, &actor)?;
                    self.confirm_locked(&mut current, &actor, None).await
                }
                actual => Err(EngineError::PaymentState {
                    payment: payment.id,
                    expected: PaymentStatus::Pending,
                    actual,
                }),
            },
        }
    }

    /// Customer re-confirmation after a commit `Conflict`, optionally with a
    /// new start picked from the fresh proposal.
    pub async fn confirm_booking(
        &self,
        booking_id: Ulid,
        actor: Actor,
        start: Option<Ms>,
    ) -> Result<Booking, EngineError> {
        if let Some(s) = start {
            validate_instant("start", s)?;
        }
        let shared = self.require_booking(&booking_id)?;
        let mut current = shared.lock().await;
        self.authorize_edge(&current, BookingStatus::Booked, &actor)?;
        self.confirm_locked(&mut current, &actor, start).await
    }

    /// `payment_pending -> booked`. Caller holds the booking mutex and has
    /// checked the edge.
    pub(super) async fn confirm_locked(
        &self,
        current: &mut Booking,
        actor: &Actor,
        start: Option<Ms>,
    ) -> Result<Booking, EngineError> {
        self.require_authorized(current)?;
        let mut candidate = current.clone();
        if start.is_some() {
            candidate.requested_start = start;
        }

        let (schedule, resources) = self.commit_schedule(&candidate).await?;
        let mut next = advance(&candidate, BookingStatus::Booked, *actor, self.now());
        next.scheduled = Some(schedule);
        next.assigned_resources = resources.clone();

        if let Err(e) = self
            .notify_parties(&next, BookingStatus::Booked, actor, NotificationKind::StatusChanged)
            .await
        {
            self.rollback_schedule(&next, resources).await;
            return Err(e);
        }
        match self.write_transition(current, next.clone()).await {
            Ok(written) => Ok(written),
            Err(e) => {
                self.rollback_schedule(&next, resources).await;
                Err(e)
            }
        }
    }

    /// Customer retry after a declined or expired authorization.
    pub async fn retry_payment(&self, booking_id: Ulid, actor: Actor) -> Result<Booking, EngineError> {
        let shared = self.require_booking(&booking_id)?;
        let current = shared.lock().await;
        if !matches!(actor, Actor::Admin) && actor != Actor::Customer(current.customer_id) {
            return Err(EngineError::Forbidden {
                role: actor.role(),
                action: "retry payment".into(),
            });
        }
        if current.status != BookingStatus::PaymentPending {
            return Err(EngineError::validation(
                "status",
                format!("payment can only be retried while payment_pending, booking is {}", current.status),
            ));
        }
        let payment = self.booking_payment(&current)?;
        if !matches!(payment.status, PaymentStatus::Failed | PaymentStatus::Expired) {
            return Err(EngineError::PaymentState {
                payment: payment.id,
                expected: PaymentStatus::Failed,
                actual: payment.status,
            });
        }

        let reference = self
            .gateway
            .authorize(payment.id, payment.amount_cents, &payment.currency)
            .await
            .map_err(|e| {
                warn!(payment = %payment.id, "authorization retry failed: {e}");
                EngineError::PaymentFailure(e.to_string())
            })?;
        self.cas_payment(payment.id, payment.status, |p| {
            p.status = PaymentStatus::Pending;
            p.gateway_reference = Some(reference);
            Ok(())
        })
        .await?;
        info!(booking = %booking_id, payment = %payment.id, "authorization requested again");
        Ok(current.clone())
    }

    /// `in_progress -> completed`: capture the escrow exactly once, then
    /// record completion.
    pub(super) async fn complete_locked(
        &self,
        current: &mut Booking,
        actor: &Actor,
    ) -> Result<Booking, EngineError> {
        let payment = self.booking_payment(current)?;

        // A capture that succeeded before a crash left the payment completed
        // but the booking in progress; only the status write is missing.
        if payment.status == PaymentStatus::Completed && !payment.capture_in_flight {
            warn!(booking = %current.id, payment = %payment.id, "payment already captured, recording completion");
        } else {
            self.capture(&payment).await?;
        }

        let next = advance(current, BookingStatus::Completed, *actor, self.now());
        match self.write_transition(current, next).await {
            Ok(written) => {
                self.notify_after_write(&written, actor, NotificationKind::PaymentCaptured)
                    .await;
                Ok(written)
            }
            Err(e) => {
                error!(
                    booking = %current.id,
                    payment = %payment.id,
                    "escrow captured but completion not recorded, needs manual follow-up: {e}"
                );
                Err(e)
            }
        }
    }

    async fn capture(&self, payment: &Payment) -> Result<(), EngineError> {
        let reference = Self::reference_of(payment)?.to_string();
        self.cas_payment(payment.id, PaymentStatus::Authorized, |p| {
            if p.capture_in_flight {
                return Err(EngineError::PaymentFailure(format!(
                    "capture of payment {} already in flight",
                    p.id
                )));
            }
            p.capture_in_flight = true;
            Ok(())
        })
        .await?;

        let max_attempts = self.config.capture_max_attempts.clamp(1, MAX_CAPTURE_ATTEMPTS);
        let mut attempts = 0u32;
        let result = loop {
            attempts += 1;
            match self
                .gateway
                .capture(payment.id, &reference, payment.amount_cents)
                .await
            {
                Ok(()) => break Ok(()),
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    metrics::counter!(crate::observability::PAYMENT_CAPTURES_TOTAL, "status" => "retry")
                        .increment(1);
                    let backoff = capture_backoff(self.config.capture_backoff_ms, attempts);
                    warn!(payment = %payment.id, attempts, backoff_ms = backoff, "capture failed, retrying: {e}");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(()) => {
                self.cas_payment(payment.id, PaymentStatus::Authorized, |p| {
                    p.status = PaymentStatus::Completed;
                    p.capture_in_flight = false;
                    p.capture_attempts += attempts;
                    Ok(())
                })
                .await
                .inspect_err(|e| {
                    error!(payment = %payment.id, "escrow captured but not recorded: {e}");
                })?;
                metrics::counter!(crate::observability::PAYMENT_CAPTURES_TOTAL, "status" => "ok")
                    .increment(1);
                info!(payment = %payment.id, attempts, amount_cents = payment.amount_cents, "escrow captured");
                Ok(())
            }
            Err(e) => {
                metrics::counter!(crate::observability::PAYMENT_CAPTURES_TOTAL, "status" => "failed")
                    .increment(1);
                error!(
                    payment = %payment.id,
                    booking = %payment.booking_id,
                    attempts,
                    "capture failed, escrow still authorized, needs manual intervention: {e}"
                );
                self.cas_payment(payment.id, PaymentStatus::Authorized, |p| {
                    p.capture_in_flight = false;
                    p.capture_attempts += attempts;
                    Ok(())
                })
                .await?;
                Err(EngineError::PaymentFailure(e.to_string()))
            }
        }
    }

    /// Release an authorized hold in full.
    async fn release_hold(&self, payment: &Payment) -> Result<(), EngineError> {
        let reference = Self::reference_of(payment)?.to_string();
        self.gateway
            .refund(payment.id, &reference, payment.amount_cents)
            .await
            .map_err(|e| {
                error!(payment = %payment.id, "hold release failed: {e}");
                EngineError::PaymentFailure(e.to_string())
            })?;
        self.cas_payment(payment.id, PaymentStatus::Authorized, |p| {
            p.status = PaymentStatus::Refunded;
            p.refunded_cents = p.amount_cents;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// `* -> cancelled`: release any hold, drop a pending authorization.
    pub(super) async fn cancel_locked(
        &self,
        current: &mut Booking,
        actor: &Actor,
    ) -> Result<Booking, EngineError> {
        if current.payment_id.is_some() {
            let payment = self.booking_payment(current)?;
            match payment.status {
                PaymentStatus::Authorized => self.release_hold(&payment).await?,
                PaymentStatus::Pending => {
                    self.cas_payment(payment.id, PaymentStatus::Pending, |p| {
                        p.status = PaymentStatus::Expired;
                        Ok(())
                    })
                    .await?;
                }
                _ => {}
            }
        }

        let mut next = advance(current, BookingStatus::Cancelled, *actor, self.now());
        next.requested_start = None;
        match self.write_transition(current, next).await {
            Ok(written) => {
                self.notify_after_write(&written, actor, NotificationKind::StatusChanged)
                    .await;
                Ok(written)
            }
            Err(e) => {
                error!(booking = %current.id, "hold released but cancellation not recorded: {e}");
                Err(e)
            }
        }
    }

    /// `dispute -> refunded`. A captured payment may be refunded in part;
    /// an uncaptured hold is always released in full.
    pub(super) async fn refund_locked(
        &self,
        current: &mut Booking,
        actor: &Actor,
        refund_cents: Option<u64>,
    ) -> Result<Booking, EngineError> {
        let payment = self.booking_payment(current)?;
        match payment.status {
            PaymentStatus::Authorized => {
                if let Some(amount) = refund_cents
                    && amount != payment.amount_cents
                {
                    debug!(payment = %payment.id, amount, "partial release of a hold is a full release");
                }
                self.release_hold(&payment).await?;
            }
            PaymentStatus::Completed | PaymentStatus::PartiallyRefunded => {
                let remaining = payment.amount_cents - payment.refunded_cents;
                let amount = refund_cents.unwrap_or(remaining);
                if amount == 0 || amount > remaining {
                    return Err(EngineError::validation(
                        "refund_amount",
                        format!("must be between 1 and {remaining}"),
                    ));
                }
                let reference = Self::reference_of(&payment)?.to_string();
                self.gateway
                    .refund(payment.id, &reference, amount)
                    .await
                    .map_err(|e| {
                        error!(payment = %payment.id, amount, "refund failed: {e}");
                        EngineError::PaymentFailure(e.to_string())
                    })?;
                self.cas_payment(payment.id, payment.status, |p| {
                    p.refunded_cents += amount;
                    p.status = if p.refunded_cents == p.amount_cents {
                        PaymentStatus::Refunded
                    } else {
                        PaymentStatus::PartiallyRefunded
                    };
                    Ok(())
                })
                .await?;
                info!(payment = %payment.id, amount, "refund issued");
            }
            actual => {
                return Err(EngineError::PaymentState {
                    payment: payment.id,
                    expected: PaymentStatus::Completed,
                    actual,
                });
            }
        }

        let next = advance(current, BookingStatus::Refunded, *actor, self.now());
        match self.write_transition(current, next).await {
            Ok(written) => {
                self.notify_after_write(&written, actor, NotificationKind::Refunded)
                    .await;
                Ok(written)
            }
            Err(e) => {
                error!(booking = %current.id, "refund issued but not recorded: {e}");
                Err(e)
            }
        }
    }

    /// Expire pending authorizations older than the configured TTL and cancel
    /// their bookings as the system actor. Disputed bookings are left alone.
    /// Returns how many payments were expired.
    pub async fn expire_stale_authorizations(&self, now: Ms) -> usize {
        let ttl = self.config.authorization_ttl_ms;
        let stale: Vec<(Ulid, Ulid)> = self
            .payments
            .iter()
            .filter(|e| e.status == PaymentStatus::Pending && e.updated_at + ttl <= now)
            .map(|e| (e.id, e.booking_id))
            .collect();

        let mut expired = 0;
        for (payment_id, booking_id) in stale {
            let Ok(shared) = self.require_booking(&booking_id) else {
                debug!(payment = %payment_id, "reaper skip: booking missing");
                continue;
            };
            let mut current = shared.lock().await;
            if current.status == BookingStatus::Dispute {
                debug!(booking = %booking_id, "reaper skip: booking in dispute");
                continue;
            }
            if let Err(e) = self
                .cas_payment(payment_id, PaymentStatus::Pending, |p| {
                    p.status = PaymentStatus::Expired;
                    Ok(())
                })
                .await
            {
                debug!(payment = %payment_id, "reaper skip: {e}");
                continue;
            }
            expired += 1;
            metrics::counter!(crate::observability::AUTHORIZATIONS_EXPIRED_TOTAL).increment(1);
            info!(payment = %payment_id, booking = %booking_id, "pending authorization expired");

            if lifecycle_allows_system_cancel(&current)
                && let Err(e) = self.cancel_locked(&mut current, &Actor::System).await
            {
                warn!(booking = %booking_id, "cancel after expiry failed: {e}");
            }
        }
        expired
    }
}

fn lifecycle_allows_system_cancel(booking: &Booking) -> bool {
    crate::lifecycle::authorize(booking, BookingStatus::Cancelled, &Actor::System).is_ok()
}

/// Wait after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`,
/// saturating, capped at [`MAX_CAPTURE_BACKOFF_MS`].
fn capture_backoff(base_ms: u64, attempt: u32) -> u64 {
    let factor = 1u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(MAX_CAPTURE_BACKOFF_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(capture_backoff(200, 1), 200);
        assert_eq!(capture_backoff(200, 2), 400);
        assert_eq!(capture_backoff(200, 3), 800);
        assert_eq!(capture_backoff(200, 64), MAX_CAPTURE_BACKOFF_MS);
        assert_eq!(capture_backoff(u64::MAX, 2), MAX_CAPTURE_BACKOFF_MS);
        assert_eq!(capture_backoff(0, 40), 0);
    }
}

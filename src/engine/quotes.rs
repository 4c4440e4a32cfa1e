use tracing::{error, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::NotificationKind;

use super::conflict::{validate_currency, validate_instant, validate_text};
use super::transitions::advance;
use super::{Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteInput {
    pub amount_cents: u64,
    pub currency: String,
    pub description: String,
    pub breakdown: Vec<QuoteLine>,
}

impl QuoteInput {
    fn validate(&self) -> Result<(), EngineError> {
        if self.amount_cents == 0 {
            return Err(EngineError::validation("amount", "must be positive"));
        }
        validate_currency(&self.currency)?;
        validate_text("description", &self.description, MAX_DESCRIPTION_LEN)?;
        if self.breakdown.len() > MAX_BREAKDOWN_LINES {
            return Err(EngineError::LimitExceeded("too many breakdown lines"));
        }
        if self.breakdown.is_empty() {
            return Ok(());
        }
        let mut total: u64 = 0;
        for line in &self.breakdown {
            validate_text("breakdown", &line.label, MAX_NAME_LEN)?;
            total = total
                .checked_add(line.amount_cents)
                .ok_or_else(|| EngineError::validation("breakdown", "sum overflows"))?;
        }
        if total != self.amount_cents {
            return Err(EngineError::validation(
                "breakdown",
                format!("lines sum to {total}, quote amount is {}", self.amount_cents),
            ));
        }
        Ok(())
    }
}

/// Customer's answer to a quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteResponse {
    Accept { start: Option<Ms> },
    Reject,
}

impl Engine {
    /// `rfq -> quoted`.
    pub async fn submit_quote(
        &self,
        booking_id: Ulid,
        actor: Actor,
        input: QuoteInput,
    ) -> Result<Booking, EngineError> {
        let shared = self.require_booking(&booking_id)?;
        let mut current = shared.lock().await;
        self.authorize_edge(&current, BookingStatus::Quoted, &actor)?;
        input.validate()?;

        let now = self.now();
        let mut next = advance(&current, BookingStatus::Quoted, actor, now);
        next.quote = Some(Quote {
            amount_cents: input.amount_cents,
            currency: input.currency,
            description: input.description,
            breakdown: input.breakdown,
            submitted_at: now,
            submitted_by: actor.id().unwrap_or(current.professional_id),
        });
        self.notify_parties(&next, BookingStatus::Quoted, &actor, NotificationKind::QuoteSubmitted)
            .await?;
        self.write_transition(&mut current, next).await
    }

    /// Accept (`quoted -> quote_accepted -> payment_pending`, one write) or
    /// reject (`quoted -> quote_rejected`).
    pub async fn respond_to_quote(
        &self,
        booking_id: Ulid,
        actor: Actor,
        response: QuoteResponse,
    ) -> Result<Booking, EngineError> {
        let shared = self.require_booking(&booking_id)?;
        let mut current = shared.lock().await;

        match response {
            QuoteResponse::Reject => {
                self.authorize_edge(&current, BookingStatus::QuoteRejected, &actor)?;
                let next = advance(&current, BookingStatus::QuoteRejected, actor, self.now());
                self.notify_parties(&next, BookingStatus::QuoteRejected, &actor, NotificationKind::QuoteRejected)
                    .await?;
                self.write_transition(&mut current, next).await
            }
            QuoteResponse::Accept { start } => {
                self.authorize_edge(&current, BookingStatus::QuoteAccepted, &actor)?;
                if let Some(s) = start {
                    validate_instant("start", s)?;
                }
                let quote = current
                    .quote
                    .clone()
                    .ok_or_else(|| EngineError::validation("quote", "booking has no quote"))?;

                let now = self.now();
                let mut next = advance(&current, BookingStatus::QuoteAccepted, actor, now);
                next.record_status(BookingStatus::PaymentPending, Actor::System, now);
                next.requested_start = start;
                self.notify_parties(&next, BookingStatus::PaymentPending, &actor, NotificationKind::QuoteAccepted)
                    .await?;

                let payment_id = Ulid::new();
                let reference = self
                    .gateway
                    .authorize(payment_id, quote.amount_cents, &quote.currency)
                    .await
                    .map_err(|e| {
                        warn!(booking = %booking_id, "authorization request failed: {e}");
                        EngineError::PaymentFailure(e.to_string())
                    })?;
                self.insert_payment(Payment {
                    id: payment_id,
                    booking_id,
                    status: PaymentStatus::Pending,
                    amount_cents: quote.amount_cents,
                    currency: quote.currency,
                    gateway_reference: Some(reference),
                    refunded_cents: 0,
                    capture_attempts: 0,
                    capture_in_flight: false,
                    created_at: now,
                    updated_at: now,
                })
                .await?;

                next.payment_id = Some(payment_id);
                self.write_transition(&mut current, next).await.inspect_err(|e| {
                    error!(
                        booking = %booking_id,
                        payment = %payment_id,
                        "authorization requested but acceptance not recorded: {e}"
                    );
                })
            }
        }
    }

    /// `quote_rejected -> rfq`, clearing the rejected quote.
    pub async fn reopen_rfq(&self, booking_id: Ulid, actor: Actor) -> Result<Booking, EngineError> {
        self.update_status(booking_id, actor, BookingStatus::Rfq, None)
            .await
    }
}

use std::collections::HashSet;

use tracing::info;
use ulid::Ulid;

use crate::lifecycle::{self, SideEffect};
use crate::limits::*;
use crate::model::*;
use crate::notify::NotificationKind;

use super::conflict::{validate_instant, validate_text};
use super::{Engine, EngineError};

/// A customer's request for quote.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBooking {
    pub id: Ulid,
    pub professional_id: Ulid,
    pub project_id: Option<Ulid>,
    pub subproject_index: Option<usize>,
    pub rfq: RfqData,
}

/// Copy of `current` moved to `to`, with fields the new status may not carry cleared.
pub(super) fn advance(current: &Booking, to: BookingStatus, actor: Actor, at: Ms) -> Booking {
    let mut next = current.clone();
    next.record_status(to, actor, at);
    if !to.is_scheduled() {
        next.scheduled = None;
    }
    if !to.carries_quote() {
        next.quote = None;
    }
    next
}

fn rejection_reason(err: &EngineError) -> &'static str {
    match err {
        EngineError::InvalidTransition { .. } => "invalid_transition",
        EngineError::Forbidden { .. } => "forbidden",
        _ => "other",
    }
}

impl Engine {
    /// Check the edge for `actor`, counting refusals.
    pub(super) fn authorize_edge(
        &self,
        booking: &Booking,
        to: BookingStatus,
        actor: &Actor,
    ) -> Result<&'static lifecycle::Edge, EngineError> {
        lifecycle::authorize(booking, to, actor).inspect_err(|e| {
            metrics::counter!(
                crate::observability::TRANSITION_REJECTIONS_TOTAL,
                "reason" => rejection_reason(e)
            )
            .increment(1);
        })
    }

    /// Persist a status change and count it.
    pub(super) async fn write_transition(
        &self,
        current: &mut Booking,
        next: Booking,
    ) -> Result<Booking, EngineError> {
        let from = current.status;
        let to = next.status;
        let written = self.write_booking(current, next).await?;
        metrics::counter!(
            crate::observability::TRANSITIONS_TOTAL,
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
        info!(booking = %written.id, %from, %to, version = written.version, "booking status changed");
        Ok(written)
    }

    /// Notify, then write. For edges whose only side effect is informing the other party.
    async fn notify_and_write(
        &self,
        current: &mut Booking,
        to: BookingStatus,
        actor: &Actor,
        kind: NotificationKind,
    ) -> Result<Booking, EngineError> {
        let next = advance(current, to, *actor, self.now());
        self.notify_parties(&next, to, actor, kind).await?;
        self.write_transition(current, next).await
    }

    pub async fn create_booking(&self, actor: Actor, new: NewBooking) -> Result<Booking, EngineError> {
        let Actor::Customer(customer_id) = actor else {
            return Err(EngineError::Forbidden {
                role: actor.role(),
                action: "create bookings".into(),
            });
        };
        if self.bookings.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }
        validate_text("service_type", &new.rfq.service_type, MAX_NAME_LEN)?;
        validate_text("description", &new.rfq.description, MAX_DESCRIPTION_LEN)?;
        if let Some(start) = new.rfq.desired_start {
            validate_instant("desired_start", start)?;
        }
        if let Some(budget) = new.rfq.budget
            && budget.min_cents > budget.max_cents
        {
            return Err(EngineError::validation("budget", "min exceeds max"));
        }

        let booking_type = match (new.project_id, new.subproject_index) {
            (None, None) => BookingType::Professional,
            (Some(project_id), Some(index)) => {
                let project = self.require_project(&project_id)?;
                if index >= project.subprojects.len() {
                    return Err(EngineError::validation("subproject_index", "out of range"));
                }
                if project.company_id != new.professional_id {
                    return Err(EngineError::validation(
                        "professional_id",
                        format!("project {project_id} belongs to another company"),
                    ));
                }
                BookingType::Project
            }
            _ => {
                return Err(EngineError::validation(
                    "subproject_index",
                    "project bookings need both project_id and subproject_index",
                ));
            }
        };

        let now = self.now();
        let booking = Booking {
            id: new.id,
            booking_type,
            status: BookingStatus::Rfq,
            customer_id,
            professional_id: new.professional_id,
            project_id: new.project_id,
            subproject_index: new.subproject_index,
            rfq: new.rfq,
            quote: None,
            requested_start: None,
            scheduled: None,
            assigned_resources: Vec::new(),
            post_booking_answers: None,
            payment_id: None,
            version: 1,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        };

        self.notify_parties(&booking, BookingStatus::Rfq, &actor, NotificationKind::BookingRequested)
            .await?;
        self.wal_append(&Event::BookingWritten {
            booking: Box::new(booking.clone()),
        })
        .await?;
        self.bookings.insert(
            booking.id,
            std::sync::Arc::new(tokio::sync::Mutex::new(booking.clone())),
        );
        info!(booking = %booking.id, customer = %customer_id, "booking requested");
        Ok(booking)
    }

    /// Move a booking along a lifecycle edge, running the edge's side effect
    /// first. `refund_cents` is only read on `dispute -> refunded`.
    pub async fn update_status(
        &self,
        booking_id: Ulid,
        actor: Actor,
        to: BookingStatus,
        refund_cents: Option<u64>,
    ) -> Result<Booking, EngineError> {
        let shared = self.require_booking(&booking_id)?;
        let mut current = shared.lock().await;
        let edge = self.authorize_edge(&current, to, &actor)?;

        match edge.effect {
            SideEffect::RecordQuote => Err(EngineError::validation(
                "status",
                "quotes are recorded through submit_quote",
            )),
            SideEffect::AuthorizeHold => Err(EngineError::validation(
                "status",
                "quotes are accepted through respond_to_quote",
            )),
            SideEffect::NotifyRejection => {
                self.notify_and_write(&mut current, to, &actor, NotificationKind::QuoteRejected)
                    .await
            }
            SideEffect::ClearQuote => {
                self.notify_and_write(&mut current, to, &actor, NotificationKind::RfqReopened)
                    .await
            }
            SideEffect::RequestHold => {
                if current.payment_id.is_none() {
                    return Err(EngineError::validation("payment", "no payment requested"));
                }
                self.notify_and_write(&mut current, to, &actor, NotificationKind::StatusChanged)
                    .await
            }
            SideEffect::CommitSchedule => self.confirm_locked(&mut current, &actor, None).await,
            SideEffect::RequireAuthorized => {
                self.require_authorized(&current)?;
                self.notify_and_write(&mut current, to, &actor, NotificationKind::StatusChanged)
                    .await
            }
            SideEffect::Capture => self.complete_locked(&mut current, &actor).await,
            SideEffect::ReleaseHold => self.cancel_locked(&mut current, &actor).await,
            SideEffect::FreezeAndRelease => self.dispute_locked(&mut current, &actor).await,
            SideEffect::Refund => self.refund_locked(&mut current, &actor, refund_cents).await,
        }
    }

    /// `booked|completed -> dispute`: drop the calendar blocks, clear the
    /// schedule and freeze the booking for the admin.
    async fn dispute_locked(&self, current: &mut Booking, actor: &Actor) -> Result<Booking, EngineError> {
        let next = advance(current, BookingStatus::Dispute, *actor, self.now());
        self.notify_parties(&next, BookingStatus::Dispute, actor, NotificationKind::StatusChanged)
            .await?;
        self.release_schedule(current).await?;
        match self.write_transition(current, next).await {
            Ok(written) => Ok(written),
            Err(e) => {
                tracing::error!(
                    booking = %current.id,
                    "calendar released but dispute not recorded: {e}"
                );
                Err(e)
            }
        }
    }

    /// Write-once customer answers, accepted once the booking is scheduled.
    pub async fn submit_post_booking_answers(
        &self,
        booking_id: Ulid,
        actor: Actor,
        answers: Vec<Answer>,
    ) -> Result<Booking, EngineError> {
        let shared = self.require_booking(&booking_id)?;
        let mut current = shared.lock().await;

        if actor != Actor::Customer(current.customer_id) {
            return Err(EngineError::Forbidden {
                role: actor.role(),
                action: "submit post-booking answers".into(),
            });
        }
        if !current.status.is_scheduled() {
            return Err(EngineError::validation(
                "status",
                format!("answers are not accepted while {}", current.status),
            ));
        }
        if current.post_booking_answers.is_some() {
            return Err(EngineError::AlreadySubmitted(booking_id));
        }
        validate_answers(&answers)?;

        let mut next = current.clone();
        next.post_booking_answers = Some(answers);
        self.notify_parties(&next, next.status, &actor, NotificationKind::AnswersSubmitted)
            .await?;
        let written = self.write_booking(&mut current, next).await?;
        info!(booking = %booking_id, "post-booking answers recorded");
        Ok(written)
    }
}

fn validate_answers(answers: &[Answer]) -> Result<(), EngineError> {
    if answers.is_empty() {
        return Err(EngineError::validation("answers", "at least one answer required"));
    }
    if answers.len() > MAX_ANSWERS {
        return Err(EngineError::LimitExceeded("too many answers"));
    }
    let mut seen = HashSet::new();
    for answer in answers {
        validate_text("question_id", &answer.question_id, MAX_NAME_LEN)?;
        if !seen.insert(answer.question_id.as_str()) {
            return Err(EngineError::validation(
                "answers",
                format!("question {:?} answered twice", answer.question_id),
            ));
        }
        match &answer.value {
            AnswerValue::Text(s) | AnswerValue::Choice(s) => validate_text("answer", s, MAX_ANSWER_LEN)?,
            AnswerValue::Number(n) if !n.is_finite() => {
                return Err(EngineError::validation("answer", "not a finite number"));
            }
            AnswerValue::Number(_) | AnswerValue::Flag(_) => {}
        }
    }
    Ok(())
}

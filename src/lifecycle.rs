//! Booking and payment state machines as static edge tables.
//!
//! Nothing here touches storage. The engine asks [`authorize`] whether an
//! actor may move a booking along an edge and which side effect it owes.

use crate::engine::EngineError;
use crate::model::{Actor, Booking, BookingStatus, PaymentStatus, Role};

use BookingStatus::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    RecordQuote,
    ClearQuote,
    AuthorizeHold,
    NotifyRejection,
    RequestHold,
    CommitSchedule,
    RequireAuthorized,
    Capture,
    ReleaseHold,
    FreezeAndRelease,
    Refund,
}

#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub from: BookingStatus,
    pub to: BookingStatus,
    pub roles: &'static [Role],
    pub effect: SideEffect,
}

const fn edge(
    from: BookingStatus,
    to: BookingStatus,
    roles: &'static [Role],
    effect: SideEffect,
) -> Edge {
    Edge {
        from,
        to,
        roles,
        effect,
    }
}

const PARTIES: &[Role] = &[Role::Customer, Role::Professional];

pub const EDGES: &[Edge] = &[
    edge(Rfq, Quoted, &[Role::Professional], SideEffect::RecordQuote),
    edge(QuoteRejected, Rfq, &[Role::Professional], SideEffect::ClearQuote),
    edge(Quoted, QuoteAccepted, &[Role::Customer], SideEffect::AuthorizeHold),
    edge(Quoted, QuoteRejected, &[Role::Customer], SideEffect::NotifyRejection),
    edge(QuoteAccepted, PaymentPending, &[Role::System], SideEffect::RequestHold),
    edge(
        PaymentPending,
        Booked,
        &[Role::Gateway, Role::Customer],
        SideEffect::CommitSchedule,
    ),
    edge(Booked, InProgress, &[Role::Professional], SideEffect::RequireAuthorized),
    edge(InProgress, Completed, &[Role::Customer], SideEffect::Capture),
    edge(Rfq, Cancelled, PARTIES, SideEffect::ReleaseHold),
    edge(Quoted, Cancelled, PARTIES, SideEffect::ReleaseHold),
    edge(
        QuoteAccepted,
        Cancelled,
        &[Role::Customer, Role::System],
        SideEffect::ReleaseHold,
    ),
    edge(
        PaymentPending,
        Cancelled,
        &[Role::Customer, Role::System],
        SideEffect::ReleaseHold,
    ),
    edge(Booked, Dispute, PARTIES, SideEffect::FreezeAndRelease),
    edge(Completed, Dispute, PARTIES, SideEffect::FreezeAndRelease),
    edge(Dispute, Refunded, &[Role::Admin], SideEffect::Refund),
];

pub fn find_edge(from: BookingStatus, to: BookingStatus) -> Option<&'static Edge> {
    EDGES.iter().find(|e| e.from == from && e.to == to)
}

pub fn successors(from: BookingStatus) -> impl Iterator<Item = BookingStatus> {
    EDGES.iter().filter(move |e| e.from == from).map(|e| e.to)
}

/// Admin may take any edge except releasing escrow on completion.
fn role_allowed(edge: &Edge, role: Role) -> bool {
    if edge.roles.contains(&role) {
        return true;
    }
    role == Role::Admin && !(edge.from == InProgress && edge.to == Completed)
}

/// Customers and professionals may only act on their own bookings.
fn is_party(booking: &Booking, actor: &Actor) -> bool {
    match actor {
        Actor::Customer(id) => *id == booking.customer_id,
        Actor::Professional(id) => *id == booking.professional_id,
        Actor::Admin | Actor::Gateway | Actor::System => true,
    }
}

/// Validate `booking.status -> to` for `actor`, returning the owed side effect.
pub fn authorize(
    booking: &Booking,
    to: BookingStatus,
    actor: &Actor,
) -> Result<&'static Edge, EngineError> {
    let from = booking.status;
    let edge = find_edge(from, to).ok_or(EngineError::InvalidTransition { from, to })?;
    if !role_allowed(edge, actor.role()) || !is_party(booking, actor) {
        return Err(EngineError::Forbidden {
            role: actor.role(),
            action: format!("{from} -> {to}"),
        });
    }
    Ok(edge)
}

/// Legal payment status edges. Every payment write is checked against this.
pub fn payment_edge_allowed(from: PaymentStatus, to: PaymentStatus) -> bool {
    use PaymentStatus as P;
    matches!(
        (from, to),
        (P::Pending, P::Authorized)
            | (P::Pending, P::Failed)
            | (P::Pending, P::Expired)
            | (P::Expired, P::Refunded)
            | (P::Authorized, P::Completed)
            | (P::Authorized, P::Refunded)
            | (P::Completed, P::Refunded)
            | (P::Completed, P::PartiallyRefunded)
            | (P::PartiallyRefunded, P::PartiallyRefunded)
            | (P::PartiallyRefunded, P::Refunded)
            | (P::Failed, P::Pending)
            | (P::Expired, P::Pending)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn booking(status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            booking_type: BookingType::Project,
            status,
            customer_id: Ulid::new(),
            professional_id: Ulid::new(),
            project_id: None,
            subproject_index: None,
            rfq: RfqData {
                service_type: "plumbing".into(),
                description: "leak".into(),
                desired_start: None,
                budget: None,
            },
            quote: None,
            requested_start: None,
            scheduled: None,
            assigned_resources: vec![],
            post_booking_answers: None,
            payment_id: None,
            version: 0,
            created_at: 0,
            updated_at: 0,
            history: vec![],
        }
    }

    #[test]
    fn illegal_edges_name_both_states() {
        let b = booking(Rfq);
        let err = authorize(&b, Completed, &Actor::Customer(b.customer_id)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: Rfq,
                to: Completed
            }
        ));
        assert_eq!(err.to_string(), "invalid transition: rfq -> completed");
    }

    #[test]
    fn only_customer_completes() {
        let b = booking(InProgress);
        assert!(authorize(&b, Completed, &Actor::Customer(b.customer_id)).is_ok());
        for actor in [
            Actor::Professional(b.professional_id),
            Actor::Admin,
            Actor::Gateway,
            Actor::System,
        ] {
            assert!(matches!(
                authorize(&b, Completed, &actor),
                Err(EngineError::Forbidden { .. })
            ));
        }
    }

    #[test]
    fn strangers_are_forbidden() {
        let b = booking(Rfq);
        let err = authorize(&b, Cancelled, &Actor::Customer(Ulid::new())).unwrap_err();
        assert!(matches!(err, EngineError::Forbidden { role: Role::Customer, .. }));
    }

    #[test]
    fn admin_may_take_other_edges() {
        let b = booking(Dispute);
        assert_eq!(
            authorize(&b, Refunded, &Actor::Admin).unwrap().effect,
            SideEffect::Refund
        );
        let b = booking(Booked);
        assert!(authorize(&b, InProgress, &Actor::Admin).is_ok());
        assert!(authorize(&b, Dispute, &Actor::Customer(b.customer_id)).is_ok());
    }

    #[test]
    fn terminal_states_have_no_successors() {
        for status in BookingStatus::ALL {
            let count = successors(status).count();
            if matches!(status, Cancelled | Refunded) {
                assert_eq!(count, 0, "{status}");
            } else {
                assert!(count > 0, "{status}");
            }
        }
    }

    #[test]
    fn cancellation_roles_depend_on_stage() {
        let b = booking(PaymentPending);
        assert!(authorize(&b, Cancelled, &Actor::System).is_ok());
        assert!(matches!(
            authorize(&b, Cancelled, &Actor::Professional(b.professional_id)),
            Err(EngineError::Forbidden { .. })
        ));
        let b = booking(Booked);
        assert!(matches!(
            authorize(&b, Cancelled, &Actor::Customer(b.customer_id)),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn payment_completion_only_from_authorized() {
        use PaymentStatus as P;
        let all = [
            P::Pending,
            P::Authorized,
            P::Completed,
            P::Failed,
            P::Refunded,
            P::PartiallyRefunded,
            P::Expired,
        ];
        for from in all {
            assert_eq!(payment_edge_allowed(from, P::Completed), from == P::Authorized);
        }
        assert!(!payment_edge_allowed(P::Authorized, P::PartiallyRefunded));
        assert!(!payment_edge_allowed(P::Refunded, P::Pending));
        // Late authorization on an expired payment is released.
        assert!(payment_edge_allowed(P::Expired, P::Refunded));
        assert!(!payment_edge_allowed(P::Expired, P::Completed));
    }
}

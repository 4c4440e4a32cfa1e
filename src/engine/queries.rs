use std::time::Instant;

use chrono::Weekday;
use tokio::sync::oneshot;
use tracing::debug;
use ulid::Ulid;

use crate::model::*;

use super::availability;
use super::conflict::{graph_of, validate_span};
use super::proposal::{self, Proposal, ProposalRequest};
use super::{Engine, EngineError, WalCommand};

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.require_booking(&id)?;
        let guard = booking.lock().await;
        Ok(guard.clone())
    }

    pub fn get_payment(&self, id: Ulid) -> Result<Payment, EngineError> {
        self.payments
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// The payment attached to a booking, if one was ever created.
    pub async fn payment_for_booking(&self, booking_id: Ulid) -> Result<Option<Payment>, EngineError> {
        let booking = self.get_booking(booking_id).await?;
        Ok(booking
            .payment_id
            .and_then(|id| self.payments.get(&id).map(|e| e.value().clone())))
    }

    pub fn get_project(&self, id: Ulid) -> Result<Project, EngineError> {
        self.require_project(&id).map(|p| (*p).clone())
    }

    /// Point-in-time copy of a profile.
    pub async fn profile_snapshot(&self, id: Ulid) -> Result<AvailabilityProfile, EngineError> {
        let profile = self.require_profile(&id)?;
        let guard = profile.read().await;
        Ok(guard.clone())
    }

    /// Read-lock a profile and the company it may inherit from.
    async fn with_graph<T>(
        &self,
        resource_id: Ulid,
        f: impl FnOnce(&AvailabilityProfile, &availability::ResourceGraph<'_>) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.require_profile(&resource_id)?;
        let deps: Vec<Ulid> = self
            .company_of
            .get(&resource_id)
            .map(|c| *c.value())
            .into_iter()
            .collect();
        let guards = self.lock_profiles(&[], &[&[resource_id][..], &deps[..]].concat()).await;
        let graph = graph_of(&guards);
        let profile = graph.require(&resource_id)?;
        f(profile, &graph)
    }

    pub async fn is_available(&self, resource_id: Ulid, instant: Ms) -> Result<bool, EngineError> {
        self.with_graph(resource_id, |profile, graph| {
            availability::is_available(profile, graph, instant)
        })
        .await
    }

    pub async fn free_spans(&self, resource_id: Ulid, window: Span) -> Result<Vec<Span>, EngineError> {
        validate_span(&window)?;
        if window.start >= window.end {
            return Err(EngineError::validation("window", "start must be before end"));
        }
        self.with_graph(resource_id, |profile, graph| {
            availability::free_spans(profile, graph, &window)
        })
        .await
    }

    /// Compute the current proposal for a subproject. Read-only: takes read
    /// locks on the pool and its companies, never writes.
    pub async fn get_schedule_proposals(
        &self,
        project_id: Ulid,
        subproject_index: usize,
    ) -> Result<Proposal, EngineError> {
        let project = self.require_project(&project_id)?;
        let sub = project
            .subprojects
            .get(subproject_index)
            .ok_or_else(|| EngineError::validation("subproject_index", "out of range"))?;

        let deps = self.pool_dependencies(&sub.resources, project.company_id);
        let guards = self.lock_profiles(&[], &[&sub.resources[..], &deps[..]].concat()).await;
        let graph = graph_of(&guards);
        let company_tz = graph.require(&project.company_id)?.timezone;
        let req = ProposalRequest::for_subproject(sub, company_tz, self.now(), &self.config);

        let mode = req.mode().as_str();
        let started = Instant::now();
        let result = proposal::propose(&req, &graph);
        metrics::histogram!(crate::observability::PROPOSAL_DURATION_SECONDS, "mode" => mode)
            .record(started.elapsed().as_secs_f64());
        let outcome = match &result {
            Ok(Proposal::Available(_)) => "available",
            Ok(Proposal::NoAvailability { .. }) => "no_availability",
            Err(_) => "error",
        };
        metrics::counter!(crate::observability::PROPOSALS_TOTAL, "outcome" => outcome).increment(1);
        debug!(project = %project_id, subproject_index, outcome, "proposal computed");
        result
    }

    /// Rewrite the WAL as a minimal snapshot of current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let profiles: Vec<_> = self.profiles.iter().map(|e| e.value().clone()).collect();
        for profile in profiles {
            let guard = profile.read().await;
            events.push(Event::ProfileCreated {
                id: guard.id,
                kind: guard.kind,
                timezone: guard.timezone,
            });
            for weekday in WEEK {
                let schedule = guard.weekly.get(weekday);
                if schedule != DaySchedule::off() {
                    events.push(Event::WeekdaySet {
                        resource_id: guard.id,
                        weekday,
                        schedule,
                    });
                }
            }
            for block in &guard.blocked {
                events.push(Event::BlockAdded {
                    resource_id: guard.id,
                    block: block.clone(),
                });
            }
            for block in &guard.booking_blocks {
                events.push(Event::ScheduleCommitted {
                    resource_id: guard.id,
                    block: *block,
                });
            }
        }

        for entry in self.projects.iter() {
            events.push(Event::ProjectPublished {
                project: (**entry.value()).clone(),
            });
        }

        let bookings: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        for booking in bookings {
            let guard = booking.lock().await;
            events.push(Event::BookingWritten {
                booking: Box::new(guard.clone()),
            });
        }

        for entry in self.payments.iter() {
            events.push(Event::PaymentWritten {
                payment: entry.value().clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

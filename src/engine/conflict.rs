use std::collections::BTreeMap;
use std::ops::Deref;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tracing::{error, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{ResourceGraph, is_available};
use super::proposal::{self, ProposalRequest, Window, sub_amount};
use super::{Engine, EngineError};

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_instant(field: &'static str, t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::validation(field, "timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_text(field: &'static str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::validation(field, format!("longer than {max} bytes")));
    }
    Ok(())
}

pub(crate) fn validate_currency(code: &str) -> Result<(), EngineError> {
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(EngineError::validation(
            "currency",
            format!("{code:?} is not a three-letter ISO code"),
        ));
    }
    Ok(())
}

/// A profile lock held for a multi-resource operation.
pub(super) enum ProfileGuard {
    Read(OwnedRwLockReadGuard<AvailabilityProfile>),
    Write(OwnedRwLockWriteGuard<AvailabilityProfile>),
}

impl Deref for ProfileGuard {
    type Target = AvailabilityProfile;

    fn deref(&self) -> &AvailabilityProfile {
        match self {
            ProfileGuard::Read(g) => g,
            ProfileGuard::Write(g) => g,
        }
    }
}

pub(super) type ProfileGuards = BTreeMap<Ulid, ProfileGuard>;

pub(super) fn graph_of(guards: &ProfileGuards) -> ResourceGraph<'_> {
    guards.values().map(|g| &**g).collect()
}

impl Engine {
    /// Lock every existing profile in `write ∪ read` in ascending id order
    /// (deadlock-free), write-locking ids present in `write`. Unknown ids are
    /// skipped so the proposal engine can report them as configuration errors.
    pub(super) async fn lock_profiles(&self, write: &[Ulid], read: &[Ulid]) -> ProfileGuards {
        let mut wanted: BTreeMap<Ulid, bool> = BTreeMap::new();
        for id in read {
            wanted.entry(*id).or_insert(false);
        }
        for id in write {
            wanted.insert(*id, true);
        }

        let mut guards = BTreeMap::new();
        for (id, exclusive) in wanted {
            let Some(profile) = self.get_profile(&id) else {
                continue;
            };
            let guard = if exclusive {
                ProfileGuard::Write(profile.write_owned().await)
            } else {
                ProfileGuard::Read(profile.read_owned().await)
            };
            guards.insert(id, guard);
        }
        guards
    }

    /// Companies whose patterns the pool may inherit, plus the project owner.
    pub(super) fn pool_dependencies(&self, pool: &[Ulid], company_id: Ulid) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = pool
            .iter()
            .filter_map(|id| self.company_of.get(id).map(|c| *c.value()))
            .collect();
        ids.push(company_id);
        ids
    }

    /// Re-validate the booking's slot against the current calendars and write
    /// booking blocks on the chosen resources. Caller holds the booking mutex.
    ///
    /// Returns the schedule and assigned resources, or `Conflict` carrying a
    /// freshly computed proposal.
    pub(super) async fn commit_schedule(
        &self,
        booking: &Booking,
    ) -> Result<(Schedule, Vec<Ulid>), EngineError> {
        let (Some(project_id), Some(index)) = (booking.project_id, booking.subproject_index) else {
            return self.commit_professional_start(booking).await;
        };

        let project = self.require_project(&project_id)?;
        let sub = project
            .subprojects
            .get(index)
            .ok_or_else(|| EngineError::validation("subproject_index", "out of range"))?;
        let deps = self.pool_dependencies(&sub.resources, project.company_id);
        let mut guards = self.lock_profiles(&sub.resources, &deps).await;

        let company_tz = guards
            .get(&project.company_id)
            .map(|g| g.timezone)
            .ok_or(EngineError::NotFound(project.company_id))?;
        let req = ProposalRequest::for_subproject(sub, company_tz, self.now(), &self.config);

        let window: Window = {
            let graph = graph_of(&guards);
            let chosen = match booking.requested_start {
                Some(start) => proposal::evaluate_start(&req, &graph, start)?,
                None => proposal::propose(&req, &graph)?.earliest().cloned(),
            };
            match chosen {
                Some(window) => window,
                None => {
                    let fresh = proposal::propose(&req, &graph)?;
                    metrics::counter!(crate::observability::COMMIT_CONFLICTS_TOTAL).increment(1);
                    warn!(booking = %booking.id, "requested slot no longer free");
                    return Err(EngineError::Conflict {
                        booking: booking.id,
                        fresh: Some(Box::new(fresh)),
                    });
                }
            }
        };

        let block_start = match sub.intake {
            Some(intake) => sub_amount(company_tz, window.start, intake),
            None => window.start,
        };
        let block = BookingBlock {
            booking_id: booking.id,
            span: Span::new(block_start, window.execution_end),
        };

        for id in &window.resources {
            if let Some(guard) = guards.get(id)
                && guard.block_count() >= MAX_BLOCKS_PER_PROFILE
            {
                return Err(EngineError::LimitExceeded("too many blocks on profile"));
            }
        }
        let mut written: Vec<Ulid> = Vec::with_capacity(window.resources.len());
        for id in &window.resources {
            let Some(ProfileGuard::Write(guard)) = guards.get_mut(id) else {
                continue;
            };
            let event = Event::ScheduleCommitted {
                resource_id: *id,
                block,
            };
            if let Err(e) = self.persist_and_apply(guard, &event).await {
                warn!(booking = %booking.id, resource = %id, "schedule commit failed part-way: {e}");
                for done in &written {
                    if let Some(ProfileGuard::Write(guard)) = guards.get_mut(done) {
                        self.unwind_block(guard, booking.id).await;
                    }
                }
                return Err(e);
            }
            written.push(*id);
        }

        let schedule = Schedule {
            start: window.start,
            end: window.end,
            execution_end: window.execution_end,
            block: Some(block.span),
        };
        Ok((schedule, window.resources))
    }

    /// Professional booking without a project: the start must fall in the
    /// professional's free time, and its first minute is blocked. A
    /// professional without a calendar profile is booked unchecked.
    async fn commit_professional_start(
        &self,
        booking: &Booking,
    ) -> Result<(Schedule, Vec<Ulid>), EngineError> {
        let start = booking
            .requested_start
            .or(booking.rfq.desired_start)
            .ok_or_else(|| EngineError::validation("start", "no start requested"))?;
        let professional = booking.professional_id;
        if self.get_profile(&professional).is_none() {
            let schedule = Schedule {
                start,
                end: start,
                execution_end: start,
                block: None,
            };
            return Ok((schedule, Vec::new()));
        }

        let deps: Vec<Ulid> = self
            .company_of
            .get(&professional)
            .map(|c| *c.value())
            .into_iter()
            .collect();
        let mut guards = self.lock_profiles(&[professional], &deps).await;
        let free = {
            let graph = graph_of(&guards);
            let profile = graph.require(&professional)?;
            is_available(profile, &graph, start)?
        };
        if !free {
            metrics::counter!(crate::observability::COMMIT_CONFLICTS_TOTAL).increment(1);
            warn!(booking = %booking.id, %professional, "professional not free at requested start");
            return Err(EngineError::Conflict {
                booking: booking.id,
                fresh: None,
            });
        }

        let Some(ProfileGuard::Write(guard)) = guards.get_mut(&professional) else {
            return Err(EngineError::NotFound(professional));
        };
        if guard.block_count() >= MAX_BLOCKS_PER_PROFILE {
            return Err(EngineError::LimitExceeded("too many blocks on profile"));
        }
        let block = BookingBlock {
            booking_id: booking.id,
            span: Span::new(start, start + MINUTE_MS - 1),
        };
        let event = Event::ScheduleCommitted {
            resource_id: professional,
            block,
        };
        self.persist_and_apply(guard, &event).await?;

        let schedule = Schedule {
            start,
            end: start,
            execution_end: start,
            block: Some(block.span),
        };
        Ok((schedule, vec![professional]))
    }

    /// Drop the booking's derived blocks from every assigned resource.
    pub(super) async fn release_schedule(&self, booking: &Booking) -> Result<(), EngineError> {
        let mut resources = booking.assigned_resources.clone();
        resources.sort();
        for resource_id in resources {
            let Some(profile) = self.get_profile(&resource_id) else {
                continue;
            };
            let mut guard = profile.write().await;
            if !guard
                .booking_blocks
                .iter()
                .any(|b| b.booking_id == booking.id)
            {
                continue;
            }
            let event = Event::ScheduleReleased {
                resource_id,
                booking_id: booking.id,
            };
            self.persist_and_apply(&mut guard, &event).await?;
        }
        Ok(())
    }

    /// Release after a failed booking write; the calendar must not keep
    /// blocks for a booking that never reached `booked`.
    pub(super) async fn rollback_schedule(&self, booking: &Booking, mut resources: Vec<Ulid>) {
        resources.sort();
        for resource_id in resources {
            let Some(profile) = self.get_profile(&resource_id) else {
                continue;
            };
            let mut guard = profile.write().await;
            if guard
                .booking_blocks
                .iter()
                .any(|b| b.booking_id == booking.id)
            {
                self.unwind_block(&mut guard, booking.id).await;
            }
        }
    }

    /// Remove a block written for a booking that never reached `booked`. If
    /// the release cannot be logged the block is still dropped in memory;
    /// replay discards blocks the booking does not list as assigned.
    async fn unwind_block(&self, profile: &mut AvailabilityProfile, booking_id: Ulid) {
        let event = Event::ScheduleReleased {
            resource_id: profile.id,
            booking_id,
        };
        if let Err(e) = self.persist_and_apply(profile, &event).await {
            error!(booking = %booking_id, resource = %profile.id, "calendar rollback not logged, dropping block in memory: {e}");
            profile.remove_booking_blocks(booking_id);
        }
    }
}

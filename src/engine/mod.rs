mod availability;
mod conflict;
mod error;
mod escrow;
mod mutations;
pub mod proposal;
mod queries;
mod quotes;
mod transitions;

pub use availability::{
    Coverage, ResourceGraph, coverage_spans, effective_pattern, free_spans, is_available,
    merge_overlapping, subtract_intervals, working_spans,
};
pub use error::EngineError;
pub use escrow::PaymentOutcome;
pub use proposal::{Proposal, ProposalRequest, ScheduleProposal, Window};
pub use quotes::{QuoteInput, QuoteResponse};
pub use transitions::NewBooking;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::warn;
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::gateway::PaymentGateway;
use crate::model::*;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::wal::Wal;

pub type SharedProfile = Arc<RwLock<AvailabilityProfile>>;
pub type SharedBooking = Arc<Mutex<Booking>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

/// External capabilities the engine drives.
pub struct Collaborators {
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

pub struct Engine {
    pub profiles: DashMap<Ulid, SharedProfile>,
    pub projects: DashMap<Ulid, Arc<Project>>,
    pub bookings: DashMap<Ulid, SharedBooking>,
    /// Mutated only through compare-and-set (`escrow::cas_payment`).
    pub payments: DashMap<Ulid, Payment>,
    /// Reverse lookup: manual block id → profile id.
    pub(super) block_to_resource: DashMap<Ulid, Ulid>,
    /// Employee → company.
    pub(super) company_of: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub config: EngineConfig,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

/// Apply a profile-scoped event (no locking; caller holds the lock).
fn apply_to_profile(
    profile: &mut AvailabilityProfile,
    event: &Event,
    block_map: &DashMap<Ulid, Ulid>,
) {
    match event {
        Event::WeekdaySet {
            weekday, schedule, ..
        } => profile.weekly.set(*weekday, *schedule),
        Event::PreferenceChanged { preference, .. } => {
            if let ResourceKind::Employee {
                preference: current,
                ..
            } = &mut profile.kind
            {
                *current = *preference;
            }
        }
        Event::BlockAdded { resource_id, block } => {
            block_map.insert(block.id, *resource_id);
            profile.insert_blocked(block.clone());
        }
        Event::BlockRemoved { id, .. } => {
            profile.remove_blocked(*id);
            block_map.remove(id);
        }
        Event::ScheduleCommitted { block, .. } => profile.insert_booking_block(*block),
        Event::ScheduleReleased { booking_id, .. } => {
            profile.remove_booking_blocks(*booking_id);
        }
        // Created at the map level; the rest are not profile events.
        Event::ProfileCreated { .. }
        | Event::ProjectPublished { .. }
        | Event::BookingWritten { .. }
        | Event::PaymentWritten { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, config: EngineConfig, deps: Collaborators) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            profiles: DashMap::new(),
            projects: DashMap::new(),
            bookings: DashMap::new(),
            payments: DashMap::new(),
            block_to_resource: DashMap::new(),
            company_of: DashMap::new(),
            wal_tx,
            config,
            gateway: deps.gateway,
            notifier: deps.notifier,
            clock: deps.clock,
        };

        // Replay into plain maps first; wrap in shared handles once at the end.
        let mut profiles: HashMap<Ulid, AvailabilityProfile> = HashMap::new();
        let mut bookings: HashMap<Ulid, Booking> = HashMap::new();
        for event in events {
            match event {
                Event::ProfileCreated { id, kind, timezone } => {
                    if let ResourceKind::Employee { company_id, .. } = kind {
                        engine.company_of.insert(id, company_id);
                    }
                    profiles.insert(id, AvailabilityProfile::new(id, kind, timezone));
                }
                Event::ProjectPublished { project } => {
                    engine.projects.insert(project.id, Arc::new(project));
                }
                Event::BookingWritten { booking } => {
                    bookings.insert(booking.id, *booking);
                }
                Event::PaymentWritten { mut payment } => {
                    if payment.capture_in_flight {
                        warn!(
                            payment = %payment.id,
                            booking = %payment.booking_id,
                            "capture was in flight at shutdown; outcome unknown, \
                             retrying completion reuses the payment id as idempotency key"
                        );
                        payment.capture_in_flight = false;
                    }
                    engine.payments.insert(payment.id, payment);
                }
                other => {
                    if let Some(resource_id) = other.resource_id()
                        && let Some(profile) = profiles.get_mut(&resource_id)
                    {
                        apply_to_profile(profile, &other, &engine.block_to_resource);
                    }
                }
            }
        }
        // A commit interrupted before its booking write leaves blocks that no
        // booking claims.
        for profile in profiles.values_mut() {
            let resource = profile.id;
            let before = profile.booking_blocks.len();
            profile.booking_blocks.retain(|b| {
                bookings
                    .get(&b.booking_id)
                    .is_some_and(|booking| booking.assigned_resources.contains(&resource))
            });
            let dropped = before - profile.booking_blocks.len();
            if dropped > 0 {
                warn!(resource = %resource, dropped, "replay dropped unclaimed booking blocks");
            }
        }
        for (id, profile) in profiles {
            engine.profiles.insert(id, Arc::new(RwLock::new(profile)));
        }
        for (id, booking) in bookings {
            engine.bookings.insert(id, Arc::new(Mutex::new(booking)));
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn get_profile(&self, id: &Ulid) -> Option<SharedProfile> {
        self.profiles.get(id).map(|e| e.value().clone())
    }

    pub(super) fn require_profile(&self, id: &Ulid) -> Result<SharedProfile, EngineError> {
        self.get_profile(id).ok_or(EngineError::NotFound(*id))
    }

    pub(super) fn require_booking(&self, id: &Ulid) -> Result<SharedBooking, EngineError> {
        self.bookings
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    pub(super) fn require_project(&self, id: &Ulid) -> Result<Arc<Project>, EngineError> {
        self.projects
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    /// WAL-append + apply in one call, for profile-scoped events.
    pub(super) async fn persist_and_apply(
        &self,
        profile: &mut AvailabilityProfile,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_profile(profile, event, &self.block_to_resource);
        Ok(())
    }

    /// Persist `next` as the new state of `current`, bumping the version.
    /// Caller holds the booking's mutex.
    pub(super) async fn write_booking(
        &self,
        current: &mut Booking,
        mut next: Booking,
    ) -> Result<Booking, EngineError> {
        next.version = current.version + 1;
        next.updated_at = self.now();
        self.wal_append(&Event::BookingWritten {
            booking: Box::new(next.clone()),
        })
        .await?;
        *current = next.clone();
        Ok(next)
    }

    /// Everyone on the booking except the actor.
    fn recipients(booking: &Booking, actor: &Actor) -> Vec<Ulid> {
        match actor {
            Actor::Customer(_) => vec![booking.professional_id],
            Actor::Professional(_) => vec![booking.customer_id],
            Actor::Admin | Actor::Gateway | Actor::System => {
                vec![booking.customer_id, booking.professional_id]
            }
        }
    }

    /// Notify the counterparties; a failure is returned so the caller can abort.
    pub(super) async fn notify_parties(
        &self,
        booking: &Booking,
        status: BookingStatus,
        actor: &Actor,
        kind: NotificationKind,
    ) -> Result<(), EngineError> {
        let notification = Notification {
            booking_id: booking.id,
            kind,
            status,
            at: self.now(),
        };
        for recipient in Self::recipients(booking, actor) {
            self.notifier
                .send(&notification, recipient)
                .await
                .map_err(|e| EngineError::Notification(e.to_string()))?;
        }
        Ok(())
    }

    /// Notify after a money-moving write. Failures are logged, never propagated.
    pub(super) async fn notify_after_write(
        &self,
        booking: &Booking,
        actor: &Actor,
        kind: NotificationKind,
    ) {
        if let Err(e) = self
            .notify_parties(booking, booking.status, actor, kind)
            .await
        {
            warn!(booking = %booking.id, ?kind, "notification after write failed: {e}");
        }
    }
}

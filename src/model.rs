use std::fmt;
use std::str::FromStr;

use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only stored time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersection(&self, other: &Span) -> Option<Span> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then(|| Span::new(start, end))
    }
}

// ── Availability ─────────────────────────────────────────────────

/// A manually blocked range. Closed: both `span.start` and `span.end` are blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedRange {
    pub id: Ulid,
    pub span: Span,
    pub reason: Option<String>,
}

/// Derived block for a confirmed booking: `[start - intake, execution_end]`, closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingBlock {
    pub booking_id: Ulid,
    pub span: Span,
}

/// Convert a closed block into the half-open span it removes from availability.
pub fn closed_to_half_open(span: &Span) -> Span {
    Span::new(span.start, span.end + 1)
}

/// Working window for one weekday, in the owner's civil time.
/// An `end` of 00:00 means midnight at the end of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub available: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl DaySchedule {
    pub fn off() -> Self {
        Self {
            available: false,
            start: NaiveTime::MIN,
            end: NaiveTime::MIN,
        }
    }

    pub fn full_day() -> Self {
        Self {
            available: true,
            start: NaiveTime::MIN,
            end: NaiveTime::MIN,
        }
    }

    pub fn hours(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            available: true,
            start,
            end,
        }
    }

    pub fn ends_at_midnight(&self) -> bool {
        self.end == NaiveTime::MIN
    }

    pub fn is_valid(&self) -> bool {
        !self.available || self.ends_at_midnight() || self.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyPattern {
    /// Indexed by `Weekday::num_days_from_monday`.
    days: [DaySchedule; 7],
}

impl WeeklyPattern {
    pub fn closed() -> Self {
        Self {
            days: [DaySchedule::off(); 7],
        }
    }

    pub fn always_open() -> Self {
        Self {
            days: [DaySchedule::full_day(); 7],
        }
    }

    /// Same window Monday to Friday, weekend off.
    pub fn weekdays(start: NaiveTime, end: NaiveTime) -> Self {
        let mut pattern = Self::closed();
        for day in [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
        ] {
            pattern.set(day, DaySchedule::hours(start, end));
        }
        pattern
    }

    pub fn get(&self, day: Weekday) -> DaySchedule {
        self.days[day.num_days_from_monday() as usize]
    }

    pub fn set(&mut self, day: Weekday, schedule: DaySchedule) {
        self.days[day.num_days_from_monday() as usize] = schedule;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvailabilityPreference {
    Personal,
    SameAsCompany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Company,
    Employee {
        company_id: Ulid,
        preference: AvailabilityPreference,
    },
}

#[derive(Debug, Clone)]
pub struct AvailabilityProfile {
    pub id: Ulid,
    pub kind: ResourceKind,
    pub timezone: Tz,
    pub weekly: WeeklyPattern,
    /// Manual blocks, sorted by `span.start`.
    pub blocked: Vec<BlockedRange>,
    /// Booking-derived blocks, sorted by `span.start`.
    pub booking_blocks: Vec<BookingBlock>,
}

impl AvailabilityProfile {
    pub fn new(id: Ulid, kind: ResourceKind, timezone: Tz) -> Self {
        Self {
            id,
            kind,
            timezone,
            weekly: WeeklyPattern::closed(),
            blocked: Vec::new(),
            booking_blocks: Vec::new(),
        }
    }

    pub fn company_id(&self) -> Option<Ulid> {
        match self.kind {
            ResourceKind::Company => None,
            ResourceKind::Employee { company_id, .. } => Some(company_id),
        }
    }

    /// Insert a manual block maintaining sort order by span.start.
    pub fn insert_blocked(&mut self, block: BlockedRange) {
        let pos = self
            .blocked
            .binary_search_by_key(&block.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.blocked.insert(pos, block);
    }

    pub fn remove_blocked(&mut self, id: Ulid) -> Option<BlockedRange> {
        let pos = self.blocked.iter().position(|b| b.id == id)?;
        Some(self.blocked.remove(pos))
    }

    pub fn insert_booking_block(&mut self, block: BookingBlock) {
        let pos = self
            .booking_blocks
            .binary_search_by_key(&block.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.booking_blocks.insert(pos, block);
    }

    pub fn remove_booking_blocks(&mut self, booking_id: Ulid) -> usize {
        let before = self.booking_blocks.len();
        self.booking_blocks.retain(|b| b.booking_id != booking_id);
        before - self.booking_blocks.len()
    }

    /// All blocked spans (manual and booking-derived, closed) that touch the query.
    /// Uses binary search to skip blocks starting at or after `query.end`.
    pub fn blocks_touching(&self, query: &Span) -> Vec<Span> {
        let manual_bound = self.blocked.partition_point(|b| b.span.start < query.end);
        let booking_bound = self
            .booking_blocks
            .partition_point(|b| b.span.start < query.end);
        let mut spans: Vec<Span> = self.blocked[..manual_bound]
            .iter()
            .map(|b| b.span)
            .chain(self.booking_blocks[..booking_bound].iter().map(|b| b.span))
            .filter(|s| s.end >= query.start)
            .collect();
        spans.sort_by_key(|s| s.start);
        spans
    }

    pub fn block_count(&self) -> usize {
        self.blocked.len() + self.booking_blocks.len()
    }
}

// ── Projects ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationUnit {
    Hours,
    Days,
    Weeks,
}

/// Granularity a subproject is scheduled at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeMode {
    Hours,
    Days,
}

impl TimeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeMode::Hours => "hours",
            TimeMode::Days => "days",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeAmount {
    pub value: u32,
    pub unit: DurationUnit,
}

impl TimeAmount {
    pub fn hours(value: u32) -> Self {
        Self {
            value,
            unit: DurationUnit::Hours,
        }
    }

    pub fn days(value: u32) -> Self {
        Self {
            value,
            unit: DurationUnit::Days,
        }
    }

    pub fn mode(&self) -> TimeMode {
        match self.unit {
            DurationUnit::Hours => TimeMode::Hours,
            DurationUnit::Days | DurationUnit::Weeks => TimeMode::Days,
        }
    }

    /// Whole civil days, `None` for hour amounts.
    pub fn as_days(&self) -> Option<u32> {
        match self.unit {
            DurationUnit::Hours => None,
            DurationUnit::Days => Some(self.value),
            DurationUnit::Weeks => Some(self.value * 7),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pricing {
    Fixed {
        amount_cents: u64,
    },
    Unit {
        price_per_unit_cents: u64,
        unit: String,
        /// Name of the `Number` professional input holding the quantity.
        quantity_field: String,
    },
    Rfq,
}

/// Professional-supplied field, tagged by field type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfessionalInput {
    Text {
        name: String,
        value: String,
    },
    Number {
        name: String,
        value: f64,
        unit: Option<String>,
    },
    Dropdown {
        name: String,
        options: Vec<String>,
        selected: Option<String>,
    },
    Range {
        name: String,
        min: f64,
        max: f64,
    },
}

impl ProfessionalInput {
    pub fn name(&self) -> &str {
        match self {
            ProfessionalInput::Text { name, .. }
            | ProfessionalInput::Number { name, .. }
            | ProfessionalInput::Dropdown { name, .. }
            | ProfessionalInput::Range { name, .. } => name,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            ProfessionalInput::Number { value, .. } => Some(*value),
            _ => None,
        }
    }
}

fn default_min_resources() -> u32 {
    1
}

fn default_min_overlap() -> u8 {
    90
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subproject {
    pub name: String,
    pub pricing: Pricing,
    pub execution: TimeAmount,
    #[serde(default)]
    pub buffer: Option<TimeAmount>,
    /// Renovation projects only.
    #[serde(default)]
    pub intake: Option<TimeAmount>,
    #[serde(default)]
    pub warranty: Option<TimeAmount>,
    pub resources: Vec<Ulid>,
    #[serde(default = "default_min_resources")]
    pub min_resources: u32,
    #[serde(default = "default_min_overlap")]
    pub min_overlap_percentage: u8,
    #[serde(default)]
    pub professional_inputs: Vec<ProfessionalInput>,
}

impl Subproject {
    pub fn mode(&self) -> TimeMode {
        self.execution.mode()
    }

    pub fn input(&self, name: &str) -> Option<&ProfessionalInput> {
        self.professional_inputs.iter().find(|i| i.name() == name)
    }

    /// List price derived from pricing and professional inputs. `None` for RFQ
    /// pricing or when the quantity input is missing.
    pub fn estimated_price_cents(&self) -> Option<u64> {
        match &self.pricing {
            Pricing::Fixed { amount_cents } => Some(*amount_cents),
            Pricing::Unit {
                price_per_unit_cents,
                quantity_field,
                ..
            } => {
                let quantity = self.input(quantity_field)?.as_number()?;
                if !quantity.is_finite() || quantity < 0.0 {
                    return None;
                }
                Some((quantity * *price_per_unit_cents as f64).round() as u64)
            }
            Pricing::Rfq => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Ulid,
    pub company_id: Ulid,
    pub category: String,
    pub subprojects: Vec<Subproject>,
}

impl Project {
    pub fn is_renovation(&self) -> bool {
        self.category.eq_ignore_ascii_case("renovation")
    }
}

// ── Actors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Customer,
    Professional,
    Admin,
    Gateway,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Customer => "customer",
            Role::Professional => "professional",
            Role::Admin => "admin",
            Role::Gateway => "gateway",
            Role::System => "system",
        };
        f.write_str(s)
    }
}

/// Caller identity as resolved by the (external) identity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    Customer(Ulid),
    Professional(Ulid),
    Admin,
    Gateway,
    System,
}

impl Actor {
    pub fn role(&self) -> Role {
        match self {
            Actor::Customer(_) => Role::Customer,
            Actor::Professional(_) => Role::Professional,
            Actor::Admin => Role::Admin,
            Actor::Gateway => Role::Gateway,
            Actor::System => Role::System,
        }
    }

    pub fn id(&self) -> Option<Ulid> {
        match self {
            Actor::Customer(id) | Actor::Professional(id) => Some(*id),
            _ => None,
        }
    }

    /// Parse `customer:<ulid>`, `professional:<ulid>`, `admin`, `gateway`.
    pub fn parse(s: &str) -> Option<Actor> {
        match s.split_once(':') {
            Some(("customer", id)) => Ulid::from_string(id).ok().map(Actor::Customer),
            Some(("professional", id)) => Ulid::from_string(id).ok().map(Actor::Professional),
            None if s == "admin" => Some(Actor::Admin),
            None if s == "gateway" => Some(Actor::Gateway),
            _ => None,
        }
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Rfq,
    Quoted,
    QuoteAccepted,
    QuoteRejected,
    PaymentPending,
    Booked,
    InProgress,
    Completed,
    Cancelled,
    Dispute,
    Refunded,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 11] = [
        BookingStatus::Rfq,
        BookingStatus::Quoted,
        BookingStatus::QuoteAccepted,
        BookingStatus::QuoteRejected,
        BookingStatus::PaymentPending,
        BookingStatus::Booked,
        BookingStatus::InProgress,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
        BookingStatus::Dispute,
        BookingStatus::Refunded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Rfq => "rfq",
            BookingStatus::Quoted => "quoted",
            BookingStatus::QuoteAccepted => "quote_accepted",
            BookingStatus::QuoteRejected => "quote_rejected",
            BookingStatus::PaymentPending => "payment_pending",
            BookingStatus::Booked => "booked",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Dispute => "dispute",
            BookingStatus::Refunded => "refunded",
        }
    }

    /// States in which `Booking::scheduled` may be set.
    pub fn is_scheduled(&self) -> bool {
        matches!(
            self,
            BookingStatus::Booked | BookingStatus::InProgress | BookingStatus::Completed
        )
    }

    /// States in which `Booking::quote` may be set.
    pub fn carries_quote(&self) -> bool {
        matches!(
            self,
            BookingStatus::Quoted
                | BookingStatus::QuoteAccepted
                | BookingStatus::QuoteRejected
                | BookingStatus::PaymentPending
                | BookingStatus::Booked
                | BookingStatus::InProgress
                | BookingStatus::Completed
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BookingStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown booking status: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingType {
    Professional,
    Project,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetRange {
    pub min_cents: u64,
    pub max_cents: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RfqData {
    pub service_type: String,
    pub description: String,
    pub desired_start: Option<Ms>,
    pub budget: Option<BudgetRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteLine {
    pub label: String,
    pub amount_cents: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub amount_cents: u64,
    pub currency: String,
    pub description: String,
    pub breakdown: Vec<QuoteLine>,
    pub submitted_at: Ms,
    pub submitted_by: Ulid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub start: Ms,
    pub end: Ms,
    /// `end` plus buffer.
    pub execution_end: Ms,
    /// Closed range blocked on each assigned resource, `None` for bookings
    /// outside a project calendar.
    pub block: Option<Span>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnswerValue {
    Text(String),
    Number(f64),
    Choice(String),
    Flag(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: String,
    pub value: AnswerValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: BookingStatus,
    pub to: BookingStatus,
    pub actor: Actor,
    pub at: Ms,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub booking_type: BookingType,
    pub status: BookingStatus,
    pub customer_id: Ulid,
    pub professional_id: Ulid,
    pub project_id: Option<Ulid>,
    pub subproject_index: Option<usize>,
    pub rfq: RfqData,
    pub quote: Option<Quote>,
    /// Start the customer picked from a proposal; validated when the schedule commits.
    pub requested_start: Option<Ms>,
    pub scheduled: Option<Schedule>,
    pub assigned_resources: Vec<Ulid>,
    pub post_booking_answers: Option<Vec<Answer>>,
    pub payment_id: Option<Ulid>,
    pub version: u64,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub history: Vec<StatusChange>,
}

impl Booking {
    /// Move to `to`, recording history. Callers have already validated the edge.
    pub fn record_status(&mut self, to: BookingStatus, actor: Actor, at: Ms) {
        self.history.push(StatusChange {
            from: self.status,
            to,
            actor,
            at,
        });
        self.status = to;
        self.updated_at = at;
    }

    /// Checks the scheduled/quote field invariants for the current status.
    pub fn invariants_hold(&self) -> bool {
        (self.scheduled.is_none() || self.status.is_scheduled())
            && (self.quote.is_none() || self.status.carries_quote())
    }
}

// ── Payments ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Authorized,
    Completed,
    Failed,
    Refunded,
    PartiallyRefunded,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Authorized => "authorized",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::PartiallyRefunded => "partially_refunded",
            PaymentStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub status: PaymentStatus,
    pub amount_cents: u64,
    pub currency: String,
    pub gateway_reference: Option<String>,
    pub refunded_cents: u64,
    pub capture_attempts: u32,
    /// Set while a capture call is outstanding; guards against a second capture.
    pub capture_in_flight: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
}

// ── WAL records ──────────────────────────────────────────────────

/// The event types: flat, no nesting beyond snapshots. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ProfileCreated {
        id: Ulid,
        kind: ResourceKind,
        timezone: Tz,
    },
    WeekdaySet {
        resource_id: Ulid,
        weekday: Weekday,
        schedule: DaySchedule,
    },
    PreferenceChanged {
        resource_id: Ulid,
        preference: AvailabilityPreference,
    },
    BlockAdded {
        resource_id: Ulid,
        block: BlockedRange,
    },
    BlockRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
    ScheduleCommitted {
        resource_id: Ulid,
        block: BookingBlock,
    },
    ScheduleReleased {
        resource_id: Ulid,
        booking_id: Ulid,
    },
    ProjectPublished {
        project: Project,
    },
    BookingWritten {
        booking: Box<Booking>,
    },
    PaymentWritten {
        payment: Payment,
    },
}

impl Event {
    /// Profile the event applies to, for profile-scoped events.
    pub fn resource_id(&self) -> Option<Ulid> {
        match self {
            Event::WeekdaySet { resource_id, .. }
            | Event::PreferenceChanged { resource_id, .. }
            | Event::BlockAdded { resource_id, .. }
            | Event::BlockRemoved { resource_id, .. }
            | Event::ScheduleCommitted { resource_id, .. }
            | Event::ScheduleReleased { resource_id, .. } => Some(*resource_id),
            Event::ProfileCreated { id, .. } => Some(*id),
            Event::ProjectPublished { .. }
            | Event::BookingWritten { .. }
            | Event::PaymentWritten { .. } => None,
        }
    }
}

//! Earliest-window search across a resource pool.
//!
//! Everything here is a pure function of a [`ProposalRequest`] and a borrowed
//! [`ResourceGraph`]; the result is advisory and holds no locks or state.

use std::cmp::Reverse;
use std::collections::HashSet;

use chrono_tz::Tz;
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::limits::MAX_POOL_SIZE;
use crate::model::*;
use crate::timezone;

use super::EngineError;
use super::availability::{
    Coverage, ResourceGraph, coverage_spans, intersect_spans, measure, working_and_free,
};

/// A concrete execution slot plus the resources suggested for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub start: Ms,
    pub end: Ms,
    pub execution_end: Ms,
    pub resources: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleProposal {
    pub mode: TimeMode,
    pub earliest_bookable: Ms,
    pub earliest: Window,
    /// Days mode only.
    pub shortest_throughput: Option<Window>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proposal {
    Available(ScheduleProposal),
    NoAvailability {
        mode: TimeMode,
        earliest_bookable: Ms,
        searched_until: Ms,
    },
}

impl Proposal {
    pub fn earliest(&self) -> Option<&Window> {
        match self {
            Proposal::Available(p) => Some(&p.earliest),
            Proposal::NoAvailability { .. } => None,
        }
    }

    pub fn mode(&self) -> TimeMode {
        match self {
            Proposal::Available(p) => p.mode,
            Proposal::NoAvailability { mode, .. } => *mode,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProposalRequest {
    pub execution: TimeAmount,
    pub buffer: Option<TimeAmount>,
    pub intake: Option<TimeAmount>,
    pub pool: Vec<Ulid>,
    pub min_resources: u32,
    pub min_overlap_percentage: u8,
    /// Zone whose midnights delimit days; the owning company's.
    pub timezone: Tz,
    pub now: Ms,
    pub min_lead_time_ms: Ms,
    pub horizon_days: u32,
}

impl ProposalRequest {
    pub fn for_subproject(sub: &Subproject, timezone: Tz, now: Ms, config: &EngineConfig) -> Self {
        Self {
            execution: sub.execution,
            buffer: sub.buffer,
            intake: sub.intake,
            pool: sub.resources.clone(),
            min_resources: sub.min_resources,
            min_overlap_percentage: sub.min_overlap_percentage,
            timezone,
            now,
            min_lead_time_ms: config.min_lead_time_ms,
            horizon_days: config.horizon_days,
        }
    }

    pub fn mode(&self) -> TimeMode {
        self.execution.mode()
    }

    /// `now + lead + intake`, rounded up to the minute (hours) or the next
    /// local midnight (days).
    pub fn earliest_bookable(&self) -> Ms {
        let mut t = self.now + self.min_lead_time_ms.max(0);
        if let Some(intake) = self.intake {
            t = add_amount(self.timezone, t, intake);
        }
        match self.mode() {
            TimeMode::Hours => timezone::ceil_to_minute(t),
            TimeMode::Days => timezone::ceil_to_local_midnight(self.timezone, t),
        }
    }

    pub fn horizon_end(&self) -> Ms {
        timezone::add_days(self.timezone, self.now, self.horizon_days as i64)
    }

    pub fn execution_end(&self, end: Ms) -> Ms {
        match self.buffer {
            Some(buffer) => add_amount(self.timezone, end, buffer),
            None => end,
        }
    }

    fn execution_ms(&self) -> Ms {
        self.execution.value as Ms * HOUR_MS
    }

    fn no_availability(&self) -> Proposal {
        Proposal::NoAvailability {
            mode: self.mode(),
            earliest_bookable: self.earliest_bookable(),
            searched_until: self.horizon_end(),
        }
    }
}

/// Hours are exact; days and weeks are civil days in `tz`.
pub fn add_amount(tz: Tz, from: Ms, amount: TimeAmount) -> Ms {
    match amount.as_days() {
        None => from + amount.value as Ms * HOUR_MS,
        Some(days) => timezone::add_days(tz, from, days as i64),
    }
}

pub fn sub_amount(tz: Tz, from: Ms, amount: TimeAmount) -> Ms {
    match amount.as_days() {
        None => from - amount.value as Ms * HOUR_MS,
        Some(days) => timezone::add_days(tz, from, -(days as i64)),
    }
}

/// Fails fast on a pool that can never satisfy the request.
pub fn validate(req: &ProposalRequest, graph: &ResourceGraph<'_>) -> Result<(), EngineError> {
    if req.execution.value == 0 {
        return Err(EngineError::validation("execution", "duration must be positive"));
    }
    if req.pool.is_empty() {
        return Err(EngineError::Configuration("resource pool is empty".into()));
    }
    if req.pool.len() > MAX_POOL_SIZE {
        return Err(EngineError::LimitExceeded("resource pool too large"));
    }
    if req.min_resources == 0 {
        return Err(EngineError::Configuration(
            "min_resources must be at least 1".into(),
        ));
    }
    if req.min_resources as usize > req.pool.len() {
        return Err(EngineError::Configuration(format!(
            "min_resources {} exceeds pool size {}",
            req.min_resources,
            req.pool.len()
        )));
    }
    if !(1..=100).contains(&req.min_overlap_percentage) {
        return Err(EngineError::Configuration(format!(
            "min_overlap_percentage {} outside 1..=100",
            req.min_overlap_percentage
        )));
    }
    let mut seen = HashSet::with_capacity(req.pool.len());
    for id in &req.pool {
        if !seen.insert(*id) {
            return Err(EngineError::Configuration(format!(
                "resource {id} listed twice in pool"
            )));
        }
        if graph.get(id).is_none() {
            return Err(EngineError::Configuration(format!("unknown resource {id}")));
        }
    }
    Ok(())
}

pub fn propose(req: &ProposalRequest, graph: &ResourceGraph<'_>) -> Result<Proposal, EngineError> {
    validate(req, graph)?;
    let earliest_bookable = req.earliest_bookable();
    let horizon_end = req.horizon_end();
    if earliest_bookable >= horizon_end {
        return Ok(req.no_availability());
    }

    match req.mode() {
        TimeMode::Hours => {
            let pool = PoolScan::run(req, graph, &Span::new(earliest_bookable, horizon_end))?;
            let coverage = pool.coverage(req);
            let exec = req.execution_ms();
            let earliest = pool
                .candidate_starts(earliest_bookable)
                .into_iter()
                .take_while(|&start| start + exec <= horizon_end)
                .find_map(|start| hours_window(req, &pool, &coverage, start));
            Ok(match earliest {
                Some(earliest) => Proposal::Available(ScheduleProposal {
                    mode: TimeMode::Hours,
                    earliest_bookable,
                    earliest,
                    shortest_throughput: None,
                }),
                None => req.no_availability(),
            })
        }
        TimeMode::Days => {
            let grid = DayGrid::build(req, graph, earliest_bookable, horizon_end)?;
            let windows: Vec<Window> = grid
                .runs(execution_days(req))
                .iter()
                .filter_map(|run| grid.window(req, run))
                .collect();
            let Some(first) = windows.first() else {
                return Ok(req.no_availability());
            };
            let shortest = windows
                .iter()
                .min_by_key(|w| w.end - w.start)
                .unwrap_or(first);
            Ok(Proposal::Available(ScheduleProposal {
                mode: TimeMode::Days,
                earliest_bookable,
                earliest: first.clone(),
                shortest_throughput: Some(shortest.clone()),
            }))
        }
    }
}

/// Re-run the feasibility predicate for one specific start.
/// `None` means the slot is no longer free (or never was).
pub fn evaluate_start(
    req: &ProposalRequest,
    graph: &ResourceGraph<'_>,
    start: Ms,
) -> Result<Option<Window>, EngineError> {
    validate(req, graph)?;
    let earliest_bookable = req.earliest_bookable();
    let horizon_end = req.horizon_end();
    if start < earliest_bookable {
        return Ok(None);
    }

    match req.mode() {
        TimeMode::Hours => {
            let end = start + req.execution_ms();
            if start.rem_euclid(MINUTE_MS) != 0 || end > horizon_end {
                return Ok(None);
            }
            let pool = PoolScan::run(req, graph, &Span::new(start, end))?;
            let coverage = pool.coverage(req);
            Ok(hours_window(req, &pool, &coverage, start))
        }
        TimeMode::Days => {
            let grid = DayGrid::build(req, graph, earliest_bookable, horizon_end)?;
            Ok(grid
                .runs(execution_days(req))
                .into_iter()
                .find(|run| run.start == start)
                .and_then(|run| grid.window(req, &run)))
        }
    }
}

fn execution_days(req: &ProposalRequest) -> usize {
    req.execution.as_days().unwrap_or(0) as usize
}

fn meets_overlap(covered: Ms, length: Ms, percentage: u8) -> bool {
    covered * 100 >= length * percentage as Ms
}

/// Measure of `spans ∩ [start, end)` for a short sorted list.
fn measure_within(spans: &[Span], start: Ms, end: Ms) -> Ms {
    let window = Span::new(start, end);
    spans
        .iter()
        .filter_map(|s| s.intersection(&window))
        .map(|s| s.duration_ms())
        .sum()
}

/// Per-resource working and free spans over one scan window.
struct PoolScan {
    ids: Vec<Ulid>,
    working: Vec<Vec<Span>>,
    free: Vec<Vec<Span>>,
}

impl PoolScan {
    fn run(
        req: &ProposalRequest,
        graph: &ResourceGraph<'_>,
        window: &Span,
    ) -> Result<Self, EngineError> {
        let mut scan = PoolScan {
            ids: Vec::with_capacity(req.pool.len()),
            working: Vec::with_capacity(req.pool.len()),
            free: Vec::with_capacity(req.pool.len()),
        };
        for id in &req.pool {
            let profile = graph.require(id)?;
            let (working, free) = working_and_free(profile, graph, window)?;
            scan.ids.push(*id);
            scan.working.push(working);
            scan.free.push(free);
        }
        Ok(scan)
    }

    fn coverage(&self, req: &ProposalRequest) -> Coverage {
        Coverage::new(coverage_spans(&self.free, req.min_resources as usize))
    }

    /// Instants where a jointly free window can open: every free-span start,
    /// clamped to `from` and rounded up to the minute. Sorted, deduplicated.
    fn candidate_starts(&self, from: Ms) -> Vec<Ms> {
        let mut starts: Vec<Ms> = self
            .free
            .iter()
            .flatten()
            .map(|s| timezone::ceil_to_minute(s.start.max(from)))
            .collect();
        starts.sort_unstable();
        starts.dedup();
        starts
    }

    /// `count` resources, each free at `start`, whose common free time covers
    /// `percentage` of `[start, end)`. Seeds are tried in order of most free
    /// time (ties by id) and grown greedily in the same order. Ids sorted.
    fn joint_set(&self, start: Ms, end: Ms, count: usize, percentage: u8) -> Option<Vec<Ulid>> {
        let window = Span::new(start, end);
        let length = end - start;
        let mut ranked: Vec<(Ms, Ulid, Vec<Span>)> = (0..self.ids.len())
            .filter(|&r| self.free[r].iter().any(|s| s.contains_instant(start)))
            .map(|r| {
                let clipped: Vec<Span> = self.free[r]
                    .iter()
                    .filter_map(|s| s.intersection(&window))
                    .collect();
                (measure(&clipped), self.ids[r], clipped)
            })
            .filter(|(free, _, _)| meets_overlap(*free, length, percentage))
            .collect();
        if ranked.len() < count {
            return None;
        }
        ranked.sort_by_key(|(free, id, _)| (Reverse(*free), *id));

        for seed in 0..ranked.len() {
            let mut joint = ranked[seed].2.clone();
            let mut chosen = vec![ranked[seed].1];
            for (other, (_, id, spans)) in ranked.iter().enumerate() {
                if chosen.len() == count {
                    break;
                }
                if other == seed {
                    continue;
                }
                let narrowed = intersect_spans(&joint, spans);
                if meets_overlap(measure(&narrowed), length, percentage) {
                    joint = narrowed;
                    chosen.push(*id);
                }
            }
            if chosen.len() == count {
                chosen.sort();
                return Some(chosen);
            }
        }
        None
    }
}

fn hours_window(
    req: &ProposalRequest,
    pool: &PoolScan,
    coverage: &Coverage,
    start: Ms,
) -> Option<Window> {
    let end = start + req.execution_ms();
    let pct = req.min_overlap_percentage;
    // Coverage bounds the joint free time of any `min_resources` set.
    if !coverage.contains(start)
        || !meets_overlap(coverage.measure_between(start, end), end - start, pct)
    {
        return None;
    }
    let resources = pool.joint_set(start, end, req.min_resources as usize, pct)?;
    Some(Window {
        start,
        end,
        execution_end: req.execution_end(end),
        resources,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    start: Ms,
    end: Ms,
    /// Index into `usable` of the first consumed day.
    first: usize,
}

/// Local days of the horizon and, per day, which resources can work it.
struct DayGrid {
    midnights: Vec<Ms>,
    pool: Option<PoolScan>,
    /// `available[r][d]`: resource r can work day d.
    available: Vec<Vec<bool>>,
    usable: Vec<usize>,
}

impl DayGrid {
    fn build(
        req: &ProposalRequest,
        graph: &ResourceGraph<'_>,
        earliest_bookable: Ms,
        horizon_end: Ms,
    ) -> Result<Self, EngineError> {
        let midnights = local_midnights(req.timezone, earliest_bookable, horizon_end, req.horizon_days);
        let mut grid = DayGrid {
            midnights,
            pool: None,
            available: Vec::new(),
            usable: Vec::new(),
        };
        let days = grid.midnights.len().saturating_sub(1);
        if days == 0 {
            return Ok(grid);
        }

        let window = Span::new(grid.midnights[0], grid.midnights[days]);
        let pool = PoolScan::run(req, graph, &window)?;
        let pct = req.min_overlap_percentage;
        let mut count = vec![0usize; days];
        for r in 0..pool.ids.len() {
            let working = Coverage::new(pool.working[r].clone());
            let free = Coverage::new(pool.free[r].clone());
            let row: Vec<bool> = (0..days)
                .map(|d| {
                    let (from, to) = (grid.midnights[d], grid.midnights[d + 1]);
                    let scheduled = working.measure_between(from, to);
                    scheduled > 0 && meets_overlap(free.measure_between(from, to), scheduled, pct)
                })
                .collect();
            for (d, ok) in row.iter().enumerate() {
                if *ok {
                    count[d] += 1;
                }
            }
            grid.available.push(row);
        }
        grid.usable = (0..days)
            .filter(|&d| count[d] >= req.min_resources as usize)
            .collect();
        grid.pool = Some(pool);
        Ok(grid)
    }

    /// Every run of `n` usable days, in start order. Unusable days inside a
    /// run are skipped, not counted.
    fn runs(&self, n: usize) -> Vec<Run> {
        if n == 0 || self.usable.len() < n {
            return Vec::new();
        }
        (0..=self.usable.len() - n)
            .map(|k| Run {
                start: self.midnights[self.usable[k]],
                end: self.midnights[self.usable[k + n - 1] + 1],
                first: k,
            })
            .collect()
    }

    /// The run as a window, staffed by `min_resources` resources that can
    /// each work every consumed day. `None` when no such crew exists.
    fn window(&self, req: &ProposalRequest, run: &Run) -> Option<Window> {
        let pool = self.pool.as_ref()?;
        let n = execution_days(req);
        let consumed = &self.usable[run.first..run.first + n];
        let count = req.min_resources as usize;
        let mut eligible: Vec<(Ms, Ulid)> = (0..pool.ids.len())
            .filter(|&r| consumed.iter().all(|&d| self.available[r][d]))
            .map(|r| (measure_within(&pool.free[r], run.start, run.end), pool.ids[r]))
            .collect();
        if eligible.len() < count {
            return None;
        }
        eligible.sort_by_key(|&(free, id)| (Reverse(free), id));
        let mut resources: Vec<Ulid> = eligible.into_iter().take(count).map(|(_, id)| id).collect();
        resources.sort();
        Some(Window {
            start: run.start,
            end: run.end,
            execution_end: req.execution_end(run.end),
            resources,
        })
    }
}

/// Consecutive local midnights from `first` while they stay within `until`.
fn local_midnights(tz: Tz, first: Ms, until: Ms, horizon_days: u32) -> Vec<Ms> {
    let mut midnights = Vec::new();
    let mut date = timezone::local_date(tz, first);
    let mut m = first;
    for _ in 0..=horizon_days as usize + 1 {
        if m > until {
            break;
        }
        midnights.push(m);
        match date.succ_opt() {
            Some(next) => {
                date = next;
                m = timezone::start_of_day(tz, date);
            }
            None => break,
        }
    }
    midnights
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone, Utc};

    const H: Ms = HOUR_MS;

    /// 2025-06-02 00:00 UTC, a Monday.
    fn monday() -> Ms {
        Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap().timestamp_millis()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn resource(weekly: WeeklyPattern) -> AvailabilityProfile {
        let mut p = AvailabilityProfile::new(Ulid::new(), ResourceKind::Company, chrono_tz::UTC);
        p.weekly = weekly;
        p
    }

    /// Closed block covering `[start, end)` exactly.
    fn block(p: &mut AvailabilityProfile, start: Ms, end: Ms) {
        p.insert_blocked(BlockedRange {
            id: Ulid::new(),
            span: Span::new(start, end - 1),
            reason: None,
        });
    }

    fn request(pool: &[&AvailabilityProfile], execution: TimeAmount, now: Ms) -> ProposalRequest {
        ProposalRequest {
            execution,
            buffer: None,
            intake: None,
            pool: pool.iter().map(|p| p.id).collect(),
            min_resources: 1,
            min_overlap_percentage: 90,
            timezone: chrono_tz::UTC,
            now,
            min_lead_time_ms: 0,
            horizon_days: 30,
        }
    }

    fn graph<'a>(profiles: &[&'a AvailabilityProfile]) -> ResourceGraph<'a> {
        profiles.iter().copied().collect()
    }

    fn earliest(p: &Proposal) -> &Window {
        p.earliest().expect("expected a proposal")
    }

    #[test]
    fn full_availability_starts_at_now_plus_lead() {
        let a = resource(WeeklyPattern::always_open());
        let mut req = request(&[&a], TimeAmount::hours(3), monday() + 10 * H + 30_000);
        req.min_lead_time_ms = 2 * H;

        let p = propose(&req, &graph(&[&a])).unwrap();
        let w = earliest(&p);
        assert_eq!(w.start, monday() + 12 * H + MINUTE_MS);
        assert_eq!(w.end, w.start + 3 * H);
        assert_eq!(w.execution_end, w.end);
        assert_eq!(w.resources, vec![a.id]);
    }

    #[test]
    fn second_resource_must_be_free_too() {
        let a = resource(WeeklyPattern::always_open());
        let mut b = resource(WeeklyPattern::always_open());
        block(&mut b, monday(), monday() + DAY_MS);
        let mut req = request(&[&a, &b], TimeAmount::hours(2), monday());
        req.min_resources = 2;

        let p = propose(&req, &graph(&[&a, &b])).unwrap();
        let w = earliest(&p);
        assert_eq!(w.start, monday() + DAY_MS);
        assert_eq!(w.resources.len(), 2);

        // The Monday slot that only `a` can serve is rejected outright.
        assert_eq!(evaluate_start(&req, &graph(&[&a, &b]), monday()).unwrap(), None);
    }

    #[test]
    fn single_free_resource_never_satisfies_two() {
        let a = resource(WeeklyPattern::always_open());
        let b = resource(WeeklyPattern::closed());
        let mut req = request(&[&a, &b], TimeAmount::hours(1), monday());
        req.min_resources = 2;

        let p = propose(&req, &graph(&[&a, &b])).unwrap();
        assert_eq!(
            p,
            Proposal::NoAvailability {
                mode: TimeMode::Hours,
                earliest_bookable: monday(),
                searched_until: monday() + 30 * DAY_MS,
            }
        );
    }

    #[test]
    fn overlap_eighty_percent_rejected_ninety_five_accepted() {
        let a = resource(WeeklyPattern::always_open());
        // 8h of joint availability against a 10h execution: 80%.
        let b80 = resource(WeeklyPattern::weekdays(t(9, 0), t(17, 0)));
        let mut req = request(&[&a, &b80], TimeAmount::hours(10), monday());
        req.min_resources = 2;
        let p = propose(&req, &graph(&[&a, &b80])).unwrap();
        assert!(matches!(p, Proposal::NoAvailability { .. }));

        // 9.5h: 95%.
        let b95 = resource(WeeklyPattern::weekdays(t(9, 0), t(18, 30)));
        let mut req = request(&[&a, &b95], TimeAmount::hours(10), monday());
        req.min_resources = 2;
        let p = propose(&req, &graph(&[&a, &b95])).unwrap();
        let w = earliest(&p);
        assert_eq!(w.start, monday() + 9 * H);
        assert_eq!(w.end, monday() + 19 * H);
    }

    #[test]
    fn two_days_plus_one_day_buffer() {
        let mut a = resource(WeeklyPattern::always_open());
        block(&mut a, monday(), monday() + DAY_MS);
        let mut req = request(&[&a], TimeAmount::days(2), monday() + 10 * H);
        req.buffer = Some(TimeAmount::days(1));

        let p = propose(&req, &graph(&[&a])).unwrap();
        let w = earliest(&p);
        let tomorrow = monday() + DAY_MS;
        assert_eq!(w.start, tomorrow);
        assert_eq!(w.end, tomorrow + 2 * DAY_MS);
        assert_eq!(w.execution_end, w.start + 3 * DAY_MS);
    }

    #[test]
    fn shortest_throughput_avoids_fragmented_run() {
        // Full weekdays; Wednesday blocked.
        let mut a = resource(WeeklyPattern::weekdays(NaiveTime::MIN, NaiveTime::MIN));
        block(&mut a, monday() + 2 * DAY_MS, monday() + 3 * DAY_MS);
        let req = request(&[&a], TimeAmount::days(2), monday() + 10 * H);

        let Proposal::Available(p) = propose(&req, &graph(&[&a])).unwrap() else {
            panic!("expected availability");
        };
        // Tuesday + Thursday: finishes Friday 00:00.
        assert_eq!(p.earliest.start, monday() + DAY_MS);
        assert_eq!(p.earliest.end, monday() + 4 * DAY_MS);
        // Thursday + Friday: two elapsed days.
        let shortest = p.shortest_throughput.unwrap();
        assert_eq!(shortest.start, monday() + 3 * DAY_MS);
        assert_eq!(shortest.end, monday() + 5 * DAY_MS);
    }

    #[test]
    fn partially_blocked_day_below_threshold_is_skipped() {
        let mut a = resource(WeeklyPattern::weekdays(t(9, 0), t(17, 0)));
        // 2h of Tuesday's 8h blocked: 75% free.
        block(&mut a, monday() + DAY_MS + 9 * H, monday() + DAY_MS + 11 * H);
        let req = request(&[&a], TimeAmount::days(1), monday() + 10 * H);

        let p = propose(&req, &graph(&[&a])).unwrap();
        assert_eq!(earliest(&p).start, monday() + 2 * DAY_MS);
    }

    #[test]
    fn intake_pushes_earliest_bookable() {
        let a = resource(WeeklyPattern::always_open());
        let mut req = request(&[&a], TimeAmount::days(1), monday() + 10 * H);
        req.intake = Some(TimeAmount::days(2));
        let p = propose(&req, &graph(&[&a])).unwrap();
        // Monday 10:00 + 2 days = Wednesday 10:00, next midnight is Thursday.
        assert_eq!(earliest(&p).start, monday() + 3 * DAY_MS);
    }

    #[test]
    fn horizon_bounds_the_search() {
        let mut a = resource(WeeklyPattern::always_open());
        block(&mut a, monday(), monday() + 40 * DAY_MS);
        let req = request(&[&a], TimeAmount::hours(1), monday());
        let p = propose(&req, &graph(&[&a])).unwrap();
        assert!(matches!(
            p,
            Proposal::NoAvailability { searched_until, .. } if searched_until == monday() + 30 * DAY_MS
        ));
    }

    #[test]
    fn configuration_errors_fail_fast() {
        let a = resource(WeeklyPattern::always_open());
        let g = graph(&[&a]);

        let mut req = request(&[], TimeAmount::hours(1), monday());
        assert!(matches!(propose(&req, &g), Err(EngineError::Configuration(_))));

        req.pool = vec![a.id];
        req.min_resources = 2;
        assert!(matches!(propose(&req, &g), Err(EngineError::Configuration(_))));

        req.min_resources = 0;
        assert!(matches!(propose(&req, &g), Err(EngineError::Configuration(_))));

        req.min_resources = 1;
        req.min_overlap_percentage = 0;
        assert!(matches!(propose(&req, &g), Err(EngineError::Configuration(_))));

        req.min_overlap_percentage = 90;
        req.pool = vec![Ulid::new()];
        assert!(matches!(propose(&req, &g), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn evaluate_start_rechecks_the_same_slot() {
        let mut a = resource(WeeklyPattern::always_open());
        let req = request(&[&a], TimeAmount::hours(2), monday());
        let start = earliest(&propose(&req, &graph(&[&a])).unwrap()).start;
        assert!(evaluate_start(&req, &graph(&[&a]), start).unwrap().is_some());

        block(&mut a, start, start + H);
        assert_eq!(evaluate_start(&req, &graph(&[&a]), start).unwrap(), None);
        // Off-minute starts are never valid.
        assert_eq!(evaluate_start(&req, &graph(&[&a]), start + 1).unwrap(), None);
    }

    #[test]
    fn handoff_between_resources_is_not_joint_availability() {
        // a free 00-05, c free 05-10, b free 00-10; nothing after 10:00.
        let mut a = resource(WeeklyPattern::always_open());
        let mut b = resource(WeeklyPattern::always_open());
        let mut c = resource(WeeklyPattern::always_open());
        block(&mut a, monday() + 5 * H, monday() + 40 * DAY_MS);
        block(&mut b, monday() + 10 * H, monday() + 40 * DAY_MS);
        block(&mut c, monday(), monday() + 5 * H);
        block(&mut c, monday() + 10 * H, monday() + 40 * DAY_MS);
        let g = graph(&[&a, &b, &c]);
        let mut req = request(&[&a, &b, &c], TimeAmount::hours(10), monday());
        req.min_resources = 2;

        // Two resources are free at every instant, but no pair shares more than 50%.
        let p = propose(&req, &g).unwrap();
        assert!(matches!(p, Proposal::NoAvailability { .. }));
        assert_eq!(evaluate_start(&req, &g, monday()).unwrap(), None);

        req.min_overlap_percentage = 50;
        let p = propose(&req, &g).unwrap();
        let w = earliest(&p);
        assert_eq!(w.start, monday());
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(w.resources, expected);
    }

    #[test]
    fn day_crew_must_work_every_consumed_day() {
        let a = resource(WeeklyPattern::always_open());
        let mut b = resource(WeeklyPattern::always_open());
        let mut c = resource(WeeklyPattern::always_open());
        // Monday: a and b. Tuesday: a and c. From Wednesday: everyone.
        block(&mut b, monday() + DAY_MS, monday() + 2 * DAY_MS);
        block(&mut c, monday(), monday() + DAY_MS);
        let g = graph(&[&a, &b, &c]);
        let mut req = request(&[&a, &b, &c], TimeAmount::days(2), monday() - H);
        req.min_resources = 2;

        let Proposal::Available(p) = propose(&req, &g).unwrap() else {
            panic!("expected availability");
        };
        // Monday+Tuesday has two free resources each day but only `a` works both.
        let tuesday = monday() + DAY_MS;
        assert_eq!(p.earliest.start, tuesday);
        assert_eq!(p.earliest.end, tuesday + 2 * DAY_MS);
        let mut expected = vec![a.id, c.id];
        expected.sort();
        assert_eq!(p.earliest.resources, expected);
        assert_eq!(p.shortest_throughput.unwrap().start, tuesday);
        assert_eq!(evaluate_start(&req, &g, monday()).unwrap(), None);
    }

    #[test]
    fn suggests_least_loaded_resources() {
        let a = resource(WeeklyPattern::always_open());
        let mut b = resource(WeeklyPattern::always_open());
        let c = resource(WeeklyPattern::always_open());
        block(&mut b, monday() + 2 * H, monday() + 3 * H);
        let mut req = request(&[&a, &b, &c], TimeAmount::hours(4), monday());
        req.min_resources = 2;
        req.min_overlap_percentage = 100;

        let p = propose(&req, &graph(&[&a, &b, &c])).unwrap();
        let w = earliest(&p);
        assert_eq!(w.start, monday());
        let mut expected = vec![a.id, c.id];
        expected.sort();
        assert_eq!(w.resources, expected);
    }
}

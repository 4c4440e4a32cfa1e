use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::*;
use crate::timezone;

use super::EngineError;

// ── Resource graph ────────────────────────────────────────────────

/// Borrowed view over a set of profiles, enough to resolve inheritance
/// (`same_as_company`) without touching the engine's shared state.
#[derive(Default)]
pub struct ResourceGraph<'a> {
    profiles: HashMap<Ulid, &'a AvailabilityProfile>,
}

impl<'a> ResourceGraph<'a> {
    pub fn new() -> Self {
        Self {
            profiles: HashMap::new(),
        }
    }

    pub fn insert(&mut self, profile: &'a AvailabilityProfile) {
        self.profiles.insert(profile.id, profile);
    }

    pub fn get(&self, id: &Ulid) -> Option<&'a AvailabilityProfile> {
        self.profiles.get(id).copied()
    }

    pub fn require(&self, id: &Ulid) -> Result<&'a AvailabilityProfile, EngineError> {
        self.get(id).ok_or(EngineError::NotFound(*id))
    }
}

impl<'a> FromIterator<&'a AvailabilityProfile> for ResourceGraph<'a> {
    fn from_iter<I: IntoIterator<Item = &'a AvailabilityProfile>>(iter: I) -> Self {
        let mut graph = ResourceGraph::new();
        for profile in iter {
            graph.insert(profile);
        }
        graph
    }
}

// ── Calendar algorithm ────────────────────────────────────────────

/// Weekly pattern and the zone it is expressed in.
///
/// Companies and `personal` employees use their own; `same_as_company`
/// employees inherit the company's pattern and timezone.
pub fn effective_pattern(
    profile: &AvailabilityProfile,
    graph: &ResourceGraph<'_>,
) -> Result<(WeeklyPattern, Tz), EngineError> {
    match profile.kind {
        ResourceKind::Company
        | ResourceKind::Employee {
            preference: AvailabilityPreference::Personal,
            ..
        } => Ok((profile.weekly, profile.timezone)),
        ResourceKind::Employee {
            company_id,
            preference: AvailabilityPreference::SameAsCompany,
        } => {
            let company = graph.require(&company_id)?;
            Ok((company.weekly, company.timezone))
        }
    }
}

/// Expand a weekly pattern into absolute working spans clipped to `window`.
/// Each civil day is resolved with the zone's rules, so DST days are 23h or 25h.
pub fn working_spans(pattern: &WeeklyPattern, tz: Tz, window: &Span) -> Vec<Span> {
    let first = timezone::local_date(tz, window.start);
    let last = timezone::local_date(tz, window.end - 1);
    let first = first.pred_opt().unwrap_or(first);

    let mut spans = Vec::new();
    for date in first.iter_days().take_while(|d| *d <= last) {
        if let Some(span) = day_window(pattern, tz, date)
            && let Some(clipped) = span.intersection(window)
        {
            spans.push(clipped);
        }
    }
    merge_overlapping(&spans)
}

/// Working span of a single civil day, if any.
pub fn day_window(pattern: &WeeklyPattern, tz: Tz, date: NaiveDate) -> Option<Span> {
    let schedule = pattern.get(date.weekday());
    if !schedule.available {
        return None;
    }
    let start = timezone::resolve_local(tz, date.and_time(schedule.start));
    let end = if schedule.ends_at_midnight() {
        timezone::start_of_day(tz, date.succ_opt()?)
    } else {
        timezone::resolve_local(tz, date.and_time(schedule.end))
    };
    (start < end).then(|| Span::new(start, end))
}

/// Manual and booking-derived blocks touching `window`, as merged half-open spans.
pub fn blocked_spans(profile: &AvailabilityProfile, window: &Span) -> Vec<Span> {
    let blocks: Vec<Span> = profile
        .blocks_touching(window)
        .iter()
        .map(closed_to_half_open)
        .collect();
    merge_overlapping(&blocks)
}

/// Scheduled working time and free time (working minus blocks) inside `window`.
pub fn working_and_free(
    profile: &AvailabilityProfile,
    graph: &ResourceGraph<'_>,
    window: &Span,
) -> Result<(Vec<Span>, Vec<Span>), EngineError> {
    let (pattern, tz) = effective_pattern(profile, graph)?;
    let working = working_spans(&pattern, tz, window);
    let blocked = blocked_spans(profile, window);
    let free = if blocked.is_empty() {
        working.clone()
    } else {
        subtract_intervals(&working, &blocked)
    };
    Ok((working, free))
}

/// Free time of a resource inside `window`: working spans minus blocks.
pub fn free_spans(
    profile: &AvailabilityProfile,
    graph: &ResourceGraph<'_>,
    window: &Span,
) -> Result<Vec<Span>, EngineError> {
    working_and_free(profile, graph, window).map(|(_, free)| free)
}

pub fn is_available(
    profile: &AvailabilityProfile,
    graph: &ResourceGraph<'_>,
    instant: Ms,
) -> Result<bool, EngineError> {
    let moment = Span::new(instant, instant + 1);
    Ok(!free_spans(profile, graph, &moment)?.is_empty())
}

// ── Interval arithmetic ───────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

pub fn measure(spans: &[Span]) -> Ms {
    spans.iter().map(Span::duration_ms).sum()
}

/// Pairwise intersection of two sorted disjoint span lists.
pub fn intersect_spans(a: &[Span], b: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if let Some(common) = a[i].intersection(&b[j]) {
            result.push(common);
        }
        if a[i].end <= b[j].end {
            i += 1;
        } else {
            j += 1;
        }
    }
    result
}

/// Sweep line over every resource's free spans: time ranges where at least
/// `min_free` resources are free at once. Sorted and merged.
pub fn coverage_spans(per_resource: &[Vec<Span>], min_free: usize) -> Vec<Span> {
    if min_free == 0 || per_resource.len() < min_free {
        return Vec::new();
    }

    let mut events: Vec<(Ms, i32)> = per_resource
        .iter()
        .flatten()
        .flat_map(|s| [(s.start, 1), (s.end, -1)])
        .collect();
    events.sort_unstable();

    let mut result: Vec<Span> = Vec::new();
    let mut count: i32 = 0;
    let mut covered_since: Option<Ms> = None;
    let mut i = 0;
    while i < events.len() {
        let time = events[i].0;
        while i < events.len() && events[i].0 == time {
            count += events[i].1;
            i += 1;
        }
        let covered = count >= min_free as i32;
        match (covered, covered_since) {
            (true, None) => covered_since = Some(time),
            (false, Some(start)) => {
                covered_since = None;
                if let Some(last) = result.last_mut()
                    && last.end == start
                {
                    last.end = time;
                } else {
                    result.push(Span::new(start, time));
                }
            }
            _ => {}
        }
    }
    result
}

/// Sorted disjoint spans with prefix sums for O(log n) measure queries.
#[derive(Debug, Clone)]
pub struct Coverage {
    spans: Vec<Span>,
    prefix: Vec<Ms>,
}

impl Coverage {
    pub fn new(spans: Vec<Span>) -> Self {
        let mut prefix = Vec::with_capacity(spans.len() + 1);
        let mut total = 0;
        prefix.push(0);
        for s in &spans {
            total += s.duration_ms();
            prefix.push(total);
        }
        Self { spans, prefix }
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    fn measure_before(&self, t: Ms) -> Ms {
        let i = self.spans.partition_point(|s| s.end <= t);
        let mut total = self.prefix[i];
        if let Some(s) = self.spans.get(i)
            && s.start < t
        {
            total += t - s.start;
        }
        total
    }

    /// Covered measure of `[start, end)`.
    pub fn measure_between(&self, start: Ms, end: Ms) -> Ms {
        if end <= start {
            return 0;
        }
        self.measure_before(end) - self.measure_before(start)
    }

    pub fn contains(&self, t: Ms) -> bool {
        let i = self.spans.partition_point(|s| s.end <= t);
        self.spans.get(i).is_some_and(|s| s.contains_instant(t))
    }
}

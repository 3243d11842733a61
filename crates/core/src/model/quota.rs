use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};

use crate::config::BackendSpec;

/// Trailing window for RPM accounting.
pub const RPM_WINDOW: Duration = Duration::from_secs(60);

/// Quota day containing `now`. Days roll over at `reset_hour_utc`, not at
/// UTC midnight.
pub fn quota_day(now: DateTime<Utc>, reset_hour_utc: u32) -> NaiveDate {
    (now - chrono::Duration::hours(i64::from(reset_hour_utc.min(23)))).date_naive()
}

#[derive(Debug, Clone)]
struct Entry {
    spec: BackendSpec,
    used_today: u32,
    exhausted: bool,
    /// Dispatch instants inside the trailing window, oldest first.
    window: VecDeque<Instant>,
}

/// Per-backend daily quota and RPM bookkeeping. Backends are addressed by
/// their index in configuration order.
#[derive(Debug, Clone)]
pub struct QuotaBook {
    entries: Vec<Entry>,
}

impl QuotaBook {
    pub fn new(specs: Vec<BackendSpec>) -> Self {
        Self {
            entries: specs
                .into_iter()
                .map(|spec| Entry { spec, used_today: 0, exhausted: false, window: VecDeque::new() })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn spec(&self, idx: usize) -> &BackendSpec {
        &self.entries[idx].spec
    }

    pub fn used_today(&self, idx: usize) -> u32 {
        self.entries[idx].used_today
    }

    pub fn is_exhausted(&self, idx: usize) -> bool {
        self.entries[idx].exhausted
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.spec.name == name)
    }

    /// Eligible backends ordered by priority (ties keep configuration order).
    /// Eligible means: not exhausted, under daily quota, and fewer than `rpm`
    /// dispatches in the trailing 60s.
    pub fn select_available(&mut self, now: Instant) -> Vec<usize> {
        for e in &mut self.entries {
            prune(&mut e.window, now);
        }
        let mut eligible: Vec<usize> = (0..self.entries.len())
            .filter(|&i| {
                let e = &self.entries[i];
                !e.exhausted
                    && e.used_today < e.spec.daily_quota
                    && e.window.len() < e.spec.rpm as usize
            })
            .collect();
        eligible.sort_by_key(|&i| self.entries[i].spec.priority);
        eligible
    }

    /// True if some backend is held back only by its RPM window.
    pub fn any_under_quota(&self) -> bool {
        self.entries.iter().any(|e| !e.exhausted && e.used_today < e.spec.daily_quota)
    }

    pub fn all_exhausted(&self) -> bool {
        self.entries.iter().all(|e| e.exhausted)
    }

    /// Position of `idx` in the whole pool's priority order (0 = best).
    pub fn rank(&self, idx: usize) -> usize {
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.sort_by_key(|&i| self.entries[i].spec.priority);
        order.iter().position(|&i| i == idx).unwrap_or(usize::MAX)
    }

    pub fn record_dispatch(&mut self, idx: usize, now: Instant) {
        self.entries[idx].window.push_back(now);
    }

    /// Count one successful call. Never exceeds the daily quota.
    pub fn record_success(&mut self, idx: usize) -> u32 {
        let e = &mut self.entries[idx];
        e.used_today = (e.used_today + 1).min(e.spec.daily_quota);
        e.used_today
    }

    pub fn mark_exhausted(&mut self, idx: usize) {
        self.entries[idx].exhausted = true;
    }

    /// Restore persisted state for the current day.
    pub fn restore(&mut self, idx: usize, used_today: u32, exhausted: bool) {
        let e = &mut self.entries[idx];
        e.used_today = used_today.min(e.spec.daily_quota);
        e.exhausted = exhausted;
    }

    /// Zero usage and clear exhaustion for every backend. RPM windows are
    /// left alone; they are wall-clock limits, not daily ones.
    pub fn reset(&mut self) {
        for e in &mut self.entries {
            e.used_today = 0;
            e.exhausted = false;
        }
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(&oldest) = window.front() {
        if now.saturating_duration_since(oldest) >= RPM_WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn book() -> QuotaBook {
        QuotaBook::new(vec![
            BackendSpec::new("b", 2, 2, 5),
            BackendSpec::new("a", 1, 1, 2),
            BackendSpec::new("c", 3, 3, 1),
        ])
    }

    #[test]
    fn ordered_by_priority() {
        let mut q = book();
        assert_eq!(q.select_available(Instant::now()), vec![1, 0, 2]);
        assert_eq!(q.rank(1), 0);
        assert_eq!(q.rank(2), 2);
    }

    #[test]
    fn rpm_window_slides() {
        let mut q = book();
        let t0 = Instant::now();
        q.record_dispatch(1, t0);
        assert_eq!(q.select_available(t0), vec![0, 2]);
        assert!(q.any_under_quota());
        assert_eq!(q.select_available(t0 + RPM_WINDOW), vec![1, 0, 2]);
    }

    #[test]
    fn quota_saturates_and_reset_clears() {
        let mut q = book();
        for _ in 0..5 {
            q.record_success(2);
        }
        assert_eq!(q.used_today(2), 1);
        q.mark_exhausted(1);
        assert_eq!(q.select_available(Instant::now()), vec![0]);
        q.reset();
        assert_eq!(q.used_today(2), 0);
        assert!(!q.is_exhausted(1));
        assert_eq!(q.select_available(Instant::now()).len(), 3);
    }

    #[test]
    fn quota_day_rolls_at_reset_hour() {
        let before = Utc.with_ymd_and_hms(2026, 3, 10, 7, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap();
        assert_eq!(quota_day(before, 8), NaiveDate::from_ymd_opt(2026, 3, 9).unwrap());
        assert_eq!(quota_day(after, 8), NaiveDate::from_ymd_opt(2026, 3, 10).unwrap());
    }

    /// xorshift; enough to drive randomized pool states without a dependency.
    struct Rng(u64);
    impl Rng {
        fn next(&mut self, bound: u64) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0 % bound.max(1)
        }
    }

    #[test]
    fn selection_never_returns_ineligible_backends() {
        let mut rng = Rng(0x9e37_79b9_7f4a_7c15);
        let t0 = Instant::now();
        for _ in 0..500 {
            let n = 1 + rng.next(5) as usize;
            let specs = (0..n)
                .map(|i| {
                    BackendSpec::new(
                        format!("m{i}"),
                        rng.next(4) as u32,
                        1 + rng.next(4) as u32,
                        rng.next(6) as u32,
                    )
                })
                .collect();
            let mut q = QuotaBook::new(specs);
            for _ in 0..rng.next(40) {
                let idx = rng.next(n as u64) as usize;
                match rng.next(3) {
                    0 => q.record_success(idx),
                    1 => {
                        q.record_dispatch(idx, t0 + Duration::from_secs(rng.next(90)));
                        0
                    }
                    _ => {
                        if rng.next(4) == 0 {
                            q.mark_exhausted(idx);
                        }
                        0
                    }
                };
            }
            let now = t0 + Duration::from_secs(90);
            let picked = q.select_available(now);
            for w in picked.windows(2) {
                assert!(q.spec(w[0]).priority <= q.spec(w[1]).priority);
            }
            for &i in &picked {
                let e = &q.entries[i];
                assert!(!e.exhausted);
                assert!(e.used_today < e.spec.daily_quota);
                let in_window = e
                    .window
                    .iter()
                    .filter(|&&t| now.saturating_duration_since(t) < RPM_WINDOW)
                    .count();
                assert!(in_window < e.spec.rpm as usize);
            }
            for i in 0..n {
                assert!(q.used_today(i) <= q.spec(i).daily_quota);
            }
            q.reset();
            for i in 0..n {
                assert_eq!(q.used_today(i), 0);
                assert!(!q.is_exhausted(i));
            }
        }
    }
}

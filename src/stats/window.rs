//! Fixed-capacity FIFO window of completed rounds with incrementally
//! maintained descriptive statistics over round duration.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

use crate::db::models::GameRecord;

/// Percentile points reported for every window.
pub const PERCENTILES: [(&str, f64); 5] = [
    ("p25", 0.25),
    ("p50", 0.50),
    ("p75", 0.75),
    ("p90", 0.90),
    ("p95", 0.95),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PercentileTable {
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
}

/// Cached duration statistics. Always consistent with the window's records
/// once a mutation returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DescriptiveStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub mode: u32,
    pub std_dev: f64,
    pub min: u32,
    pub max: u32,
    pub percentiles: PercentileTable,
    pub early_termination_rate: f64,
    pub mean_peak: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    capacity: usize,
    records: VecDeque<GameRecord>,
    /// duration → occurrences
    durations: BTreeMap<u32, usize>,
    sum: f64,
    sum_sq: f64,
    peak_sum: f64,
    early: usize,
    stats: DescriptiveStats,
}

impl Window {
    pub fn new(capacity: usize) -> Self {
        Window {
            capacity: capacity.max(1),
            records: VecDeque::with_capacity(capacity.max(1)),
            durations: BTreeMap::new(),
            sum: 0.0,
            sum_sq: 0.0,
            peak_sum: 0.0,
            early: 0,
            stats: DescriptiveStats::default(),
        }
    }

    pub fn name(&self) -> String {
        format!("last_{}", self.capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[cfg(test)]
    pub fn records(&self) -> impl Iterator<Item = &GameRecord> {
        self.records.iter()
    }

    pub fn stats(&self) -> &DescriptiveStats {
        &self.stats
    }

    /// Append a record, evicting the oldest when full. Returns the evicted one.
    pub fn insert(&mut self, record: GameRecord) -> Option<GameRecord> {
        let evicted = if self.records.len() == self.capacity {
            self.records.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            self.remove_aggregates(old);
        }
        self.add_aggregates(&record);
        self.records.push_back(record);
        self.refresh();
        evicted
    }

    /// Number of records whose duration is at least `tick`.
    pub fn count_at_least(&self, tick: u32) -> usize {
        self.durations.range(tick..).map(|(_, n)| *n).sum()
    }

    /// Linear interpolation between adjacent order statistics at rank `p·(n−1)`.
    #[cfg(test)]
    pub fn percentile(&self, p: f64) -> Option<f64> {
        self.percentiles_at(&[p]).pop()
    }

    /// Interpolated percentiles for ascending `points`, from one cumulative
    /// walk over the duration counts.
    fn percentiles_at(&self, points: &[f64]) -> Vec<f64> {
        if self.is_empty() {
            return Vec::new();
        }
        let last = (self.records.len() - 1) as f64;
        let ranks: Vec<f64> = points.iter().map(|p| p.clamp(0.0, 1.0) * last).collect();
        // lo and hi order statistic per point; non-decreasing for sorted points
        let wanted: Vec<usize> = ranks
            .iter()
            .flat_map(|r| [r.floor() as usize, r.ceil() as usize])
            .collect();

        let mut values = Vec::with_capacity(wanted.len());
        let mut next = wanted.iter().peekable();
        let mut seen = 0usize;
        for (d, n) in &self.durations {
            seen += n;
            while next.next_if(|k| **k < seen).is_some() {
                values.push(*d as f64);
            }
            if next.peek().is_none() {
                break;
            }
        }

        ranks
            .iter()
            .zip(values.chunks_exact(2))
            .map(|(rank, pair)| pair[0] + (pair[1] - pair[0]) * rank.fract())
            .collect()
    }

    fn add_aggregates(&mut self, r: &GameRecord) {
        let d = r.duration_ticks as f64;
        self.sum += d;
        self.sum_sq += d * d;
        self.peak_sum += r.peak_value;
        if r.is_early_termination {
            self.early += 1;
        }
        *self.durations.entry(r.duration_ticks).or_insert(0) += 1;
    }

    fn remove_aggregates(&mut self, r: &GameRecord) {
        let d = r.duration_ticks as f64;
        self.sum -= d;
        self.sum_sq -= d * d;
        self.peak_sum -= r.peak_value;
        if r.is_early_termination {
            self.early -= 1;
        }
        if let Some(n) = self.durations.get_mut(&r.duration_ticks) {
            *n -= 1;
            if *n == 0 {
                self.durations.remove(&r.duration_ticks);
            }
        }
    }

    fn refresh(&mut self) {
        if self.is_empty() {
            self.stats = DescriptiveStats::default();
            return;
        }
        let n = self.records.len();
        let nf = n as f64;
        let mean = self.sum / nf;
        let variance = (self.sum_sq / nf - mean * mean).max(0.0);
        // most frequent duration, ties toward the smaller value
        let mode = self
            .durations
            .iter()
            .fold((0u32, 0usize), |best, (d, c)| if *c > best.1 { (*d, *c) } else { best })
            .0;
        let points = PERCENTILES.map(|(_, p)| p);
        let values = self.percentiles_at(&points);
        let pct = |i: usize| values.get(i).copied().unwrap_or(0.0);
        let percentiles = PercentileTable {
            p25: pct(0),
            p50: pct(1),
            p75: pct(2),
            p90: pct(3),
            p95: pct(4),
        };
        self.stats = DescriptiveStats {
            count: n,
            mean,
            median: percentiles.p50,
            mode,
            std_dev: variance.sqrt(),
            min: self.durations.keys().next().copied().unwrap_or(0),
            max: self.durations.keys().next_back().copied().unwrap_or(0),
            percentiles,
            early_termination_rate: self.early as f64 / nf,
            mean_peak: self.peak_sum / nf,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::VolatilitySummary;
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn rec(id: usize, duration: u32) -> GameRecord {
        GameRecord {
            round_id: format!("r{}", id),
            duration_ticks: duration,
            peak_value: 1.0 + duration as f64 / 100.0,
            final_value: 0.0,
            is_early_termination: duration <= 10,
            volatility: VolatilitySummary::default(),
            trade_volume: 0.0,
            incomplete: false,
            revealed_seed: None,
            completed_at: Utc::now(),
        }
    }

    fn direct_mean(w: &Window) -> f64 {
        let v: Vec<f64> = w.records().map(|r| r.duration_ticks as f64).collect();
        v.iter().sum::<f64>() / v.len() as f64
    }

    #[test]
    fn count_and_mean_stay_consistent_across_evictions() {
        let mut w = Window::new(10);
        // deterministic pseudo-random durations
        let mut x: u64 = 17;
        for i in 0..257 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let d = (x >> 33) as u32 % 900 + 1;
            w.insert(rec(i, d));
            assert_eq!(w.len(), (i + 1).min(10));
            assert_eq!(w.stats().count, w.len());
            assert_relative_eq!(w.stats().mean, direct_mean(&w), epsilon = 1e-9);
            let mut sorted: Vec<u32> = w.records().map(|r| r.duration_ticks).collect();
            sorted.sort_unstable();
            assert_eq!(w.stats().min, sorted[0]);
            assert_eq!(w.stats().max, *sorted.last().unwrap());
        }
    }

    #[test]
    fn eviction_is_fifo() {
        let mut w = Window::new(3);
        for i in 0..3 {
            assert!(w.insert(rec(i, 100 + i as u32)).is_none());
        }
        let evicted = w.insert(rec(3, 500)).unwrap();
        assert_eq!(evicted.round_id, "r0");
        let ids: Vec<_> = w.records().map(|r| r.round_id.clone()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
    }

    fn sorted_percentile(sorted: &[u32], p: f64) -> f64 {
        let rank = p * (sorted.len() - 1) as f64;
        let lo = sorted[rank.floor() as usize] as f64;
        let hi = sorted[rank.ceil() as usize] as f64;
        lo + (hi - lo) * rank.fract()
    }

    #[test]
    fn percentile_table_matches_sorted_durations() {
        let mut w = Window::new(37);
        let mut x: u64 = 5;
        for i in 0..120 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            // narrow range so durations repeat
            let d = (x >> 33) as u32 % 40 + 1;
            w.insert(rec(i, d));
            let mut sorted: Vec<u32> = w.records().map(|r| r.duration_ticks).collect();
            sorted.sort_unstable();
            let t = w.stats().percentiles;
            let got = [t.p25, t.p50, t.p75, t.p90, t.p95];
            for ((_, p), v) in PERCENTILES.iter().zip(got) {
                assert_relative_eq!(v, sorted_percentile(&sorted, *p), epsilon = 1e-9);
            }
            assert_relative_eq!(w.percentile(0.0).unwrap(), sorted[0] as f64);
            assert_relative_eq!(w.percentile(1.0).unwrap(), *sorted.last().unwrap() as f64);
        }
        assert!(Window::new(3).percentile(0.5).is_none());
    }

    #[test]
    fn median_of_uniform_grid_matches_analytic_value() {
        let mut w = Window::new(100);
        for i in 1..=100u32 {
            w.insert(rec(i as usize, i * 50));
        }
        // durations 50..=5000; analytic median (2500 + 2550) / 2
        assert!((w.stats().percentiles.p50 - 2525.0).abs() <= 50.0);
        assert_relative_eq!(w.stats().median, 2525.0, epsilon = 1e-9);
        assert_relative_eq!(w.stats().mean, 2525.0, epsilon = 1e-9);
        assert!(w.stats().percentiles.p25 < w.stats().percentiles.p75);
        assert!(w.stats().percentiles.p90 <= w.stats().percentiles.p95);
    }

    #[test]
    fn mode_breaks_ties_toward_smaller_duration() {
        let mut w = Window::new(10);
        for (i, d) in [40, 20, 40, 20, 7].into_iter().enumerate() {
            w.insert(rec(i, d));
        }
        assert_eq!(w.stats().mode, 20);
        assert_relative_eq!(w.stats().early_termination_rate, 0.2, epsilon = 1e-12);
    }

    #[test]
    fn std_dev_is_population_form() {
        let mut w = Window::new(4);
        for (i, d) in [2, 4, 4, 4, 5, 5, 7, 9].into_iter().enumerate() {
            w.insert(rec(i, d));
        }
        // window holds 5, 5, 7, 9: mean 6.5, population variance 2.75
        assert_relative_eq!(w.stats().mean, 6.5, epsilon = 1e-12);
        assert_relative_eq!(w.stats().std_dev, 2.75f64.sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn count_at_least_is_inclusive() {
        let mut w = Window::new(10);
        for (i, d) in [10, 20, 30].into_iter().enumerate() {
            w.insert(rec(i, d));
        }
        assert_eq!(w.count_at_least(20), 2);
        assert_eq!(w.count_at_least(31), 0);
        assert_eq!(w.count_at_least(0), 3);
    }
}

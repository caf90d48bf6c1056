pub mod window;

use serde::Serialize;
use tracing::debug;

use crate::db::models::GameRecord;

pub use window::{DescriptiveStats, Window};

/// Result of a forward survival query. `Undefined` means no historical round
/// in the window reached the queried tick; it is never a number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Survival {
    Undefined,
    Defined { probability: f64, at_risk: usize },
}

impl Survival {
    #[cfg(test)]
    pub fn probability(&self) -> Option<f64> {
        match self {
            Survival::Undefined => None,
            Survival::Defined { probability, .. } => Some(*probability),
        }
    }
}

/// Per-window summary for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct WindowSummary {
    pub name: String,
    pub capacity: usize,
    pub stats: DescriptiveStats,
}

/// Owns every rolling window. Windows are sorted by capacity and share the
/// same stream of committed records.
#[derive(Debug, Clone)]
pub struct RollingWindowStatistics {
    windows: Vec<Window>,
    warmup_records: usize,
    total_inserted: u64,
    last_record: Option<GameRecord>,
}

impl RollingWindowStatistics {
    pub fn new(sizes: &[usize], warmup_records: usize) -> Self {
        let mut sizes: Vec<usize> = sizes.iter().copied().filter(|s| *s > 0).collect();
        sizes.sort_unstable();
        sizes.dedup();
        RollingWindowStatistics {
            windows: sizes.into_iter().map(Window::new).collect(),
            warmup_records,
            total_inserted: 0,
            last_record: None,
        }
    }

    pub fn insert(&mut self, record: &GameRecord) {
        for w in &mut self.windows {
            w.insert(record.clone());
        }
        self.total_inserted += 1;
        self.last_record = Some(record.clone());
        debug!(
            round = %record.round_id,
            duration = record.duration_ticks,
            total = self.total_inserted,
            "Window insert"
        );
    }

    /// Seed windows from persisted history, oldest first.
    pub fn preload<'a, I>(&mut self, records: I) -> usize
    where
        I: IntoIterator<Item = &'a GameRecord>,
    {
        let mut n = 0;
        for r in records {
            self.insert(r);
            n += 1;
        }
        n
    }

    pub fn window(&self, capacity: usize) -> Option<&Window> {
        self.windows.iter().find(|w| w.capacity() == capacity)
    }

    #[cfg(test)]
    pub fn total_inserted(&self) -> u64 {
        self.total_inserted
    }

    pub fn last_record(&self) -> Option<&GameRecord> {
        self.last_record.as_ref()
    }

    /// Warm-up is measured on the largest window, which holds every record
    /// any smaller window holds.
    pub fn is_warm(&self) -> bool {
        self.windows
            .last()
            .map(|w| w.len() >= self.warmup_records)
            .unwrap_or(false)
    }

    pub fn warmup_records(&self) -> usize {
        self.warmup_records
    }

    pub fn available_records(&self) -> usize {
        self.windows.last().map(|w| w.len()).unwrap_or(0)
    }

    /// `P(duration ≥ tick + horizon | duration ≥ tick)` over the named window.
    pub fn forward_survival(&self, window: usize, tick: u32, horizon: u32) -> Survival {
        let Some(w) = self.window(window) else {
            return Survival::Undefined;
        };
        let at_risk = w.count_at_least(tick);
        if at_risk == 0 {
            return Survival::Undefined;
        }
        let survivors = w.count_at_least(tick.saturating_add(horizon));
        Survival::Defined {
            probability: survivors as f64 / at_risk as f64,
            at_risk,
        }
    }

    pub fn summaries(&self) -> Vec<WindowSummary> {
        self.windows
            .iter()
            .map(|w| WindowSummary {
                name: w.name(),
                capacity: w.capacity(),
                stats: *w.stats(),
            })
            .collect()
    }
}

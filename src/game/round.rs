use chrono::{DateTime, Utc};
use std::time::Instant;

use crate::db::models::{GameRecord, VolatilitySummary};

/// One accepted heartbeat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickSample {
    pub tick: u32,
    pub price: f64,
    pub trade_volume: f64,
}

/// Result of offering a heartbeat to the live round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickUpdate {
    Accepted,
    /// Same tick as the last accepted one
    Duplicate,
    /// Older than the last accepted tick
    OutOfOrder,
}

/// The single live round. Owned by the phase machine and reused across rounds:
/// `reset` keeps the history allocation so clearing is O(1) amortized.
#[derive(Debug, Clone, PartialEq)]
pub struct InProgressRound {
    round_id: String,
    current_tick: u32,
    history: Vec<TickSample>,
    ceiling: usize,
    started_at: DateTime<Utc>,
    last_price: f64,
    peak: f64,
    abs_change_sum: f64,
    abs_change_count: u32,
    abs_change_max: f64,
    volume: f64,
    truncated: bool,
}

impl InProgressRound {
    pub fn new(max_ticks: u32) -> Self {
        let ceiling = max_ticks as usize + 1;
        InProgressRound {
            round_id: String::new(),
            current_tick: 0,
            history: Vec::with_capacity(ceiling),
            ceiling,
            started_at: Utc::now(),
            last_price: 0.0,
            peak: 0.0,
            abs_change_sum: 0.0,
            abs_change_count: 0,
            abs_change_max: 0.0,
            volume: 0.0,
            truncated: false,
        }
    }

    /// Start tracking a new round at tick 0.
    pub fn reset(&mut self, round_id: &str, opening_price: f64, now: DateTime<Utc>) {
        self.round_id.clear();
        self.round_id.push_str(round_id);
        self.history.clear();
        self.current_tick = 0;
        self.started_at = now;
        self.last_price = opening_price;
        self.peak = opening_price;
        self.abs_change_sum = 0.0;
        self.abs_change_count = 0;
        self.abs_change_max = 0.0;
        self.volume = 0.0;
        self.truncated = false;
        self.history.push(TickSample {
            tick: 0,
            price: opening_price,
            trade_volume: 0.0,
        });
    }

    /// Forget the current round entirely.
    pub fn clear(&mut self) {
        self.round_id.clear();
        self.history.clear();
        self.current_tick = 0;
    }

    pub fn is_tracking(&self) -> bool {
        !self.round_id.is_empty()
    }

    /// Accept only strictly increasing ticks.
    pub fn record(&mut self, tick: u32, price: f64, trade_volume: f64) -> TickUpdate {
        if tick == self.current_tick {
            return TickUpdate::Duplicate;
        }
        if tick < self.current_tick {
            return TickUpdate::OutOfOrder;
        }

        if self.last_price > 0.0 {
            let change = (price - self.last_price).abs() / self.last_price;
            self.abs_change_sum += change;
            self.abs_change_count += 1;
            self.abs_change_max = self.abs_change_max.max(change);
        }
        self.current_tick = tick;
        self.last_price = price;
        self.peak = self.peak.max(price);
        self.volume += trade_volume;

        if self.history.len() < self.ceiling {
            self.history.push(TickSample {
                tick,
                price,
                trade_volume,
            });
        } else {
            self.truncated = true;
        }
        TickUpdate::Accepted
    }

    pub fn round_id(&self) -> &str {
        &self.round_id
    }

    pub fn current_tick(&self) -> u32 {
        self.current_tick
    }

    pub fn history(&self) -> &[TickSample] {
        &self.history
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_price(&self) -> f64 {
        self.last_price
    }

    pub fn peak(&self) -> f64 {
        self.peak
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Mean absolute relative tick-to-tick change over the whole round so far.
    pub fn baseline_volatility(&self) -> Option<f64> {
        if self.abs_change_count == 0 {
            return None;
        }
        Some(self.abs_change_sum / self.abs_change_count as f64)
    }

    pub fn volatility_summary(&self) -> VolatilitySummary {
        VolatilitySummary {
            mean: self.baseline_volatility().unwrap_or(0.0),
            max: self.abs_change_max,
        }
    }
}

/// Event-1 data captured when a round terminates, held until event 2 (or the
/// pairing timeout) commits it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEnd {
    pub round_id: String,
    pub final_tick: u32,
    pub final_price: f64,
    pub reported_peak: Option<f64>,
    pub revealed_seed: Option<String>,
    pub observed_at: Instant,
}

/// Builds immutable [`GameRecord`]s on the end-of-round transition.
#[derive(Debug, Clone)]
pub struct GameRecordAccumulator {
    early_termination_ticks: u32,
}

impl GameRecordAccumulator {
    pub fn new(early_termination_ticks: u32) -> Self {
        GameRecordAccumulator {
            early_termination_ticks,
        }
    }

    pub fn is_early_termination(&self, final_tick: u32) -> bool {
        final_tick <= self.early_termination_ticks
    }

    pub fn build(
        &self,
        round: &InProgressRound,
        end: &PendingEnd,
        incomplete: bool,
        now: DateTime<Utc>,
    ) -> GameRecord {
        GameRecord {
            round_id: end.round_id.clone(),
            duration_ticks: end.final_tick,
            peak_value: end.reported_peak.unwrap_or_else(|| round.peak()),
            final_value: end.final_price,
            is_early_termination: self.is_early_termination(end.final_tick),
            volatility: round.volatility_summary(),
            trade_volume: round.volume(),
            incomplete,
            revealed_seed: end.revealed_seed.clone(),
            completed_at: now,
        }
    }
}

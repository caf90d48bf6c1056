//! Short-horizon heuristics over the live round's tick history.
//!
//! Every flag carries the measurements that triggered it so a recommendation
//! can be explained after the fact.

use serde::{Deserialize, Serialize};

use crate::game::round::{InProgressRound, TickSample};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EarlySignature {
    pub tick: u32,
    pub threshold: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolatilitySpike {
    pub trailing: f64,
    pub baseline: f64,
    pub ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stagnation {
    pub range: f64,
    pub price: f64,
    pub ticks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rebound {
    pub local_min: f64,
    pub price: f64,
    pub recovery: f64,
}

/// Active flags for one tick. A `None` field means the heuristic did not fire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternFlags {
    pub early_termination: Option<EarlySignature>,
    pub volatility_spike: Option<VolatilitySpike>,
    pub stagnation: Option<Stagnation>,
    pub rebound: Option<Rebound>,
}

impl PatternFlags {
    pub fn any(&self) -> bool {
        self.early_termination.is_some()
            || self.volatility_spike.is_some()
            || self.stagnation.is_some()
            || self.rebound.is_some()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.early_termination.is_some() {
            out.push("early_termination");
        }
        if self.volatility_spike.is_some() {
            out.push("volatility_spike");
        }
        if self.stagnation.is_some() {
            out.push("stagnation");
        }
        if self.rebound.is_some() {
            out.push("rebound");
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct PatternConfig {
    pub early_termination_ticks: u32,
    /// Trailing sub-window for the volatility comparison
    pub window: usize,
    pub spike_multiplier: f64,
    pub stagnation_ticks: usize,
    pub stagnation_fraction: f64,
    pub rebound_lookback: usize,
    pub rebound_fraction: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        PatternConfig {
            early_termination_ticks: 10,
            window: 8,
            spike_multiplier: 2.5,
            stagnation_ticks: 10,
            stagnation_fraction: 0.005,
            rebound_lookback: 20,
            rebound_fraction: 0.10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatternDetector {
    cfg: PatternConfig,
}

impl PatternDetector {
    pub fn new(cfg: PatternConfig) -> Self {
        PatternDetector { cfg }
    }

    pub fn detect(&self, round: &InProgressRound) -> PatternFlags {
        self.detect_history(
            round.history(),
            round.current_tick(),
            round.baseline_volatility(),
        )
    }

    pub fn detect_history(
        &self,
        history: &[TickSample],
        tick: u32,
        baseline: Option<f64>,
    ) -> PatternFlags {
        PatternFlags {
            early_termination: self.early_signature(tick),
            volatility_spike: self.volatility_spike(history, baseline),
            stagnation: self.stagnation(history),
            rebound: self.rebound(history),
        }
    }

    fn early_signature(&self, tick: u32) -> Option<EarlySignature> {
        (tick <= self.cfg.early_termination_ticks).then_some(EarlySignature {
            tick,
            threshold: self.cfg.early_termination_ticks,
        })
    }

    fn volatility_spike(
        &self,
        history: &[TickSample],
        baseline: Option<f64>,
    ) -> Option<VolatilitySpike> {
        let baseline = baseline.filter(|b| *b > 0.0)?;
        let trailing = trailing_volatility(history, self.cfg.window)?;
        let ratio = trailing / baseline;
        (ratio > self.cfg.spike_multiplier).then_some(VolatilitySpike {
            trailing,
            baseline,
            ratio,
        })
    }

    fn stagnation(&self, history: &[TickSample]) -> Option<Stagnation> {
        let n = self.cfg.stagnation_ticks;
        if n < 2 || history.len() < n {
            return None;
        }
        let tail = &history[history.len() - n..];
        let (lo, hi) = price_bounds(tail);
        let price = tail[n - 1].price;
        let range = hi - lo;
        (price > 0.0 && range < self.cfg.stagnation_fraction * price).then_some(Stagnation {
            range,
            price,
            ticks: n,
        })
    }

    fn rebound(&self, history: &[TickSample]) -> Option<Rebound> {
        if history.len() < 2 {
            return None;
        }
        let start = history.len().saturating_sub(self.cfg.rebound_lookback.max(2));
        let tail = &history[start..];
        let (local_min, _) = price_bounds(tail);
        let price = tail[tail.len() - 1].price;
        if local_min <= 0.0 {
            return None;
        }
        let recovery = (price - local_min) / local_min;
        (recovery > self.cfg.rebound_fraction).then_some(Rebound {
            local_min,
            price,
            recovery,
        })
    }
}

/// Mean absolute relative tick-to-tick change over the last `window` changes.
/// `None` until the round has that many changes.
pub fn trailing_volatility(history: &[TickSample], window: usize) -> Option<f64> {
    if window == 0 || history.len() < window + 1 {
        return None;
    }
    let tail = &history[history.len() - window - 1..];
    let mut sum = 0.0;
    let mut n = 0usize;
    for pair in tail.windows(2) {
        if pair[0].price > 0.0 {
            sum += (pair[1].price - pair[0].price).abs() / pair[0].price;
            n += 1;
        }
    }
    (n > 0).then(|| sum / n as f64)
}

fn price_bounds(samples: &[TickSample]) -> (f64, f64) {
    samples.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
        (lo.min(s.price), hi.max(s.price))
    })
}

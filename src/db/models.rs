use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bot::patterns::PatternFlags;
use crate::bot::wager::RiskProfile;
use crate::bot::zones::ZoneName;

/// Summary of tick-to-tick price movement over a round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VolatilitySummary {
    /// Mean absolute relative change between consecutive ticks
    pub mean: f64,
    /// Largest absolute relative change between consecutive ticks
    pub max: f64,
}

/// A completed round. Built once on the end-of-round transition and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    pub round_id: String,
    pub duration_ticks: u32,
    pub peak_value: f64,
    pub final_value: f64,
    pub is_early_termination: bool,
    pub volatility: VolatilitySummary,
    /// Stake-only trade volume; side-activity trades never contribute.
    pub trade_volume: f64,
    /// Committed from event-1 data alone (the paired event-2 never arrived).
    pub incomplete: bool,
    pub revealed_seed: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Action the decision layer recommends for the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Enter,
    Hold,
    Reduce,
    Exit,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Enter => "enter",
            Action::Hold => "hold",
            Action::Reduce => "reduce",
            Action::Exit => "exit",
        }
    }
}

/// An emitted recommendation. Paired later with an [`Outcome`] by
/// `(round_id, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub timestamp: DateTime<Utc>,
    pub tick: u32,
    pub round_id: String,
    pub zone: ZoneName,
    pub patterns: PatternFlags,
    pub action: Action,
    pub confidence: f64,
    /// Zero unless `action == Enter`
    pub suggested_stake: f64,
    pub profile: Option<RiskProfile>,
    /// Survival probability at `horizon_ticks` the decision was based on
    pub survival_probability: f64,
    pub horizon_ticks: u32,
}

/// What actually happened after a recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub round_id: String,
    pub recommended_at: DateTime<Utc>,
    pub ticks_to_termination: u32,
    /// horizon (ticks) → round terminated before surviving that many more
    /// ticks; the exact complement of the survival event
    pub within_horizon: BTreeMap<u32, bool>,
    pub from_incomplete_record: bool,
}

impl Outcome {
    pub fn resolve(rec: &Recommendation, record: &GameRecord, horizons: &[u32]) -> Self {
        let ticks_to_termination = record.duration_ticks.saturating_sub(rec.tick);
        let within_horizon = horizons
            .iter()
            .map(|h| (*h, ticks_to_termination < *h))
            .collect();
        Outcome {
            round_id: rec.round_id.clone(),
            recommended_at: rec.timestamp,
            ticks_to_termination,
            within_horizon,
            from_incomplete_record: record.incomplete,
        }
    }
}

//! Snapshot normalization.
//!
//! The game feed pushes one loosely-shaped JSON object per update with no
//! explicit state field. This module decodes it into a [`RawSnapshot`] that
//! tolerates unknown and missing fields, then classifies it into exactly one
//! [`NormalizedEvent`] using only the flags carried by that snapshot.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSnapshot {
    pub game_id: Option<String>,
    pub active: Option<bool>,
    pub rugged: Option<bool>,
    pub tick_count: Option<i64>,
    pub price: Option<f64>,
    pub trade_count: Option<u64>,
    pub cooldown_timer: Option<i64>,
    pub allow_pre_round_buys: Option<bool>,
    pub game_history: Option<Vec<RawHistoryEntry>>,
    pub provably_fair: Option<RawProvablyFair>,
    pub trades: Option<Vec<RawTrade>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawHistoryEntry {
    pub id: Option<String>,
    pub peak_multiplier: Option<f64>,
    pub final_tick: Option<u32>,
    pub prices: Option<Vec<f64>>,
}

impl RawHistoryEntry {
    /// Last tick of the listed round: `finalTick`, else one per price after
    /// the opening one.
    pub fn last_tick(&self) -> Option<u32> {
        self.final_tick.or_else(|| {
            self.prices
                .as_ref()
                .filter(|p| !p.is_empty())
                .and_then(|p| u32::try_from(p.len() - 1).ok())
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProvablyFair {
    pub server_seed: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTrade {
    pub qty: Option<f64>,
    /// Set only for side-activity trades that are not stakes on the round.
    pub coin_address: Option<String>,
}

/// Validated internal event. One per inbound snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    Heartbeat {
        round_id: String,
        tick: u32,
        price: f64,
        trade_count: u64,
        /// Quantity traded in this update, stake trades only
        stake_volume: f64,
    },
    RoundStart {
        round_id: String,
        price: f64,
    },
    /// Event 1 of the end-of-round pair.
    RoundEndPrimary {
        round_id: String,
        final_tick: u32,
        final_price: f64,
        /// Peak reported by the history attachment for this round, if listed
        reported_peak: Option<f64>,
        revealed_seed: Option<String>,
    },
    /// Event 2 of the end-of-round pair.
    RoundEndSecondary {
        next_round_id: String,
        terminated_round_id: Option<String>,
        cooldown_ms: u64,
    },
    PresaleWindow {
        allow_buys: bool,
        cooldown_ms: u64,
    },
}

impl NormalizedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NormalizedEvent::Heartbeat { .. } => "heartbeat",
            NormalizedEvent::RoundStart { .. } => "round_start",
            NormalizedEvent::RoundEndPrimary { .. } => "round_end_primary",
            NormalizedEvent::RoundEndSecondary { .. } => "round_end_secondary",
            NormalizedEvent::PresaleWindow { .. } => "presale_window",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    #[error("snapshot is not a JSON object")]
    NotAnObject,
    #[error("undecodable snapshot: {0}")]
    Decode(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Decode and classify a raw feed payload.
pub fn normalize(raw: &Value) -> Result<NormalizedEvent, NormalizeError> {
    if !raw.is_object() {
        return Err(NormalizeError::NotAnObject);
    }
    let snapshot: RawSnapshot =
        RawSnapshot::deserialize(raw).map_err(|e| NormalizeError::Decode(e.to_string()))?;
    classify(snapshot)
}

/// Classify an already-decoded snapshot.
pub fn classify(snap: RawSnapshot) -> Result<NormalizedEvent, NormalizeError> {
    let active = snap.active.ok_or(NormalizeError::MissingField("active"))?;
    let rugged = snap.rugged.ok_or(NormalizeError::MissingField("rugged"))?;

    match (active, rugged) {
        (true, true) => {
            let history = snap.game_history.as_deref().unwrap_or_default();
            if history.is_empty() {
                return Err(NormalizeError::MissingField("gameHistory"));
            }
            let round_id = required_id(&snap)?;
            let entry = history
                .iter()
                .find(|h| h.id.as_deref() == Some(round_id.as_str()));
            let listed_tick = entry.and_then(RawHistoryEntry::last_tick);
            let final_tick = match (snap.tick_count, listed_tick) {
                (None, Some(listed)) => listed,
                _ => required_tick(&snap)?,
            };
            if let Some(listed) = listed_tick.filter(|t| *t != final_tick) {
                debug!(
                    "Round {} ended at tick {} but history lists {}",
                    round_id, final_tick, listed
                );
            }
            let final_price = required_price(&snap)?;
            let reported_peak = entry
                .and_then(|h| h.peak_multiplier)
                .filter(|p| p.is_finite() && *p > 0.0);
            let revealed_seed = snap
                .provably_fair
                .as_ref()
                .and_then(|pf| pf.server_seed.clone());
            Ok(NormalizedEvent::RoundEndPrimary {
                round_id,
                final_tick,
                final_price,
                reported_peak,
                revealed_seed,
            })
        }
        (false, true) => {
            let next_round_id = required_id(&snap)?;
            let terminated_round_id = snap
                .game_history
                .as_deref()
                .and_then(|h| h.first())
                .and_then(|h| h.id.clone());
            Ok(NormalizedEvent::RoundEndSecondary {
                next_round_id,
                terminated_round_id,
                cooldown_ms: cooldown_ms(&snap),
            })
        }
        (true, false) => {
            let round_id = required_id(&snap)?;
            let tick = required_tick(&snap)?;
            let price = required_price(&snap)?;
            if tick == 0 {
                return Ok(NormalizedEvent::RoundStart { round_id, price });
            }
            Ok(NormalizedEvent::Heartbeat {
                round_id,
                tick,
                price,
                trade_count: snap.trade_count.unwrap_or(0),
                stake_volume: stake_volume(snap.trades.as_deref().unwrap_or_default()),
            })
        }
        (false, false) => Ok(NormalizedEvent::PresaleWindow {
            allow_buys: snap
                .allow_pre_round_buys
                .ok_or(NormalizeError::MissingField("allowPreRoundBuys"))?,
            cooldown_ms: cooldown_ms(&snap),
        }),
    }
}

/// Sum of traded quantity, excluding any trade that carries an asset address.
pub fn stake_volume(trades: &[RawTrade]) -> f64 {
    trades
        .iter()
        .filter(|t| t.coin_address.is_none())
        .filter_map(|t| t.qty)
        .filter(|q| q.is_finite() && *q > 0.0)
        .sum()
}

fn required_id(snap: &RawSnapshot) -> Result<String, NormalizeError> {
    match snap.game_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        Some(_) => Err(NormalizeError::InvalidField {
            field: "gameId",
            reason: "empty".into(),
        }),
        None => Err(NormalizeError::MissingField("gameId")),
    }
}

fn required_tick(snap: &RawSnapshot) -> Result<u32, NormalizeError> {
    let tick = snap
        .tick_count
        .ok_or(NormalizeError::MissingField("tickCount"))?;
    u32::try_from(tick).map_err(|_| NormalizeError::InvalidField {
        field: "tickCount",
        reason: format!("out of range: {}", tick),
    })
}

fn required_price(snap: &RawSnapshot) -> Result<f64, NormalizeError> {
    let price = snap.price.ok_or(NormalizeError::MissingField("price"))?;
    if !price.is_finite() || price < 0.0 {
        return Err(NormalizeError::InvalidField {
            field: "price",
            reason: format!("{}", price),
        });
    }
    Ok(price)
}

fn cooldown_ms(snap: &RawSnapshot) -> u64 {
    snap.cooldown_timer.unwrap_or(0).max(0) as u64
}

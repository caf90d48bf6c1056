//! Progressive stake sequence, bankroll and risk-profile sizing.
//!
//! The engine tracks a paper wager on "the round survives to tick + horizon".
//! It is the single owner of [`WagerState`]; the decision loop asks it for
//! ranked candidates and tells it when rounds advance or end.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::kelly;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskProfile {
    Conservative,
    Moderate,
    Aggressive,
}

impl RiskProfile {
    pub const ALL: [RiskProfile; 3] = [
        RiskProfile::Conservative,
        RiskProfile::Moderate,
        RiskProfile::Aggressive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskProfile::Conservative => "conservative",
            RiskProfile::Moderate => "moderate",
            RiskProfile::Aggressive => "aggressive",
        }
    }
}

/// Sizing limits for one profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProfileLimits {
    pub profile: RiskProfile,
    /// Hard ceiling on any single stake as a fraction of bankroll
    pub bankroll_cap: f64,
    pub kelly_multiplier: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum StakeSequenceError {
    #[error("stake sequence is empty")]
    Empty,
    #[error("stake sequence entry {index} is not a positive finite number")]
    NonPositive { index: usize },
    #[error("stake sequence decreases at entry {index}")]
    NonMonotonic { index: usize },
    #[error("base stake must be positive")]
    InvalidBase,
}

/// Precomputed stake table in currency units. Never grows at runtime.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StakeSequence {
    stakes: Vec<f64>,
}

impl StakeSequence {
    /// `units` are multiples of `base_stake`. A non-zero `max_len` truncates
    /// the table.
    pub fn new(units: &[f64], base_stake: f64, max_len: usize) -> Result<Self, StakeSequenceError> {
        if !(base_stake > 0.0) || !base_stake.is_finite() {
            return Err(StakeSequenceError::InvalidBase);
        }
        let take = if max_len == 0 { units.len() } else { max_len.min(units.len()) };
        let units = &units[..take];
        if units.is_empty() {
            return Err(StakeSequenceError::Empty);
        }
        for (index, u) in units.iter().enumerate() {
            if !(*u > 0.0) || !u.is_finite() {
                return Err(StakeSequenceError::NonPositive { index });
            }
            if index > 0 && *u < units[index - 1] {
                return Err(StakeSequenceError::NonMonotonic { index });
            }
        }
        Ok(StakeSequence {
            stakes: units.iter().map(|u| u * base_stake).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.stakes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stakes.is_empty()
    }

    pub fn stake_at(&self, level: usize) -> Option<f64> {
        self.stakes.get(level).copied()
    }

    pub fn stakes(&self) -> &[f64] {
        &self.stakes
    }
}

/// Lifecycle of one sequence attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencePhase {
    Idle,
    Staked,
    Resolved,
}

/// Terminal statuses need an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WagerStatus {
    Ready,
    InsufficientBankroll,
    SequenceExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenStake {
    pub round_id: String,
    pub entry_tick: u32,
    pub target_tick: u32,
    pub amount: f64,
    pub profile: RiskProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StakeResult {
    Won,
    Lost,
    Void,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WagerState {
    pub bankroll: f64,
    pub sequence_level: usize,
    pub stake_sequence: Vec<f64>,
    /// Outstanding exposure; never above `bankroll`
    pub cumulative_risked: f64,
    pub risk_profile: RiskProfile,
    pub phase: SequencePhase,
    pub status: WagerStatus,
    pub open: Option<OpenStake>,
    pub last_result: Option<StakeResult>,
    pub wins: u32,
    pub losses: u32,
}

/// A sized stake for one profile with its ranking score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StakeCandidate {
    pub profile: RiskProfile,
    pub amount: f64,
    /// `amount / bankroll`
    pub fraction: f64,
    pub kelly_fraction: f64,
    pub log_growth: f64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Proposal {
    /// Ranked best first; never empty
    Stake(Vec<StakeCandidate>),
    NoEdge,
    Blocked(WagerStatus),
}

#[derive(Debug, Clone)]
pub struct WagerConfig {
    pub initial_bankroll: f64,
    pub base_stake: f64,
    pub payout_odds: f64,
    pub risk_profile: RiskProfile,
    pub limits: Vec<ProfileLimits>,
}

#[derive(Debug, Clone)]
pub struct WagerSequenceEngine {
    cfg: WagerConfig,
    sequence: StakeSequence,
    state: WagerState,
}

impl WagerSequenceEngine {
    pub fn new(cfg: WagerConfig, sequence: StakeSequence) -> Self {
        let state = fresh_state(&cfg, &sequence);
        WagerSequenceEngine {
            cfg,
            sequence,
            state,
        }
    }

    pub fn state(&self) -> &WagerState {
        &self.state
    }

    pub fn is_staked(&self) -> bool {
        self.state.open.is_some()
    }

    /// Size and rank every permitted profile for a wager at `win_prob`.
    pub fn propose(&self, win_prob: f64, confidence: f64) -> Proposal {
        if self.state.status != WagerStatus::Ready {
            return Proposal::Blocked(self.state.status);
        }
        let Some(seq_stake) = self.sequence.stake_at(self.state.sequence_level) else {
            return Proposal::Blocked(WagerStatus::SequenceExhausted);
        };
        let bankroll = self.state.bankroll;
        if bankroll < self.cfg.base_stake {
            return Proposal::Blocked(WagerStatus::InsufficientBankroll);
        }
        let full_kelly = kelly::kelly_fraction(win_prob, self.cfg.payout_odds);
        if full_kelly <= 0.0 {
            return Proposal::NoEdge;
        }

        let mut ranked: Vec<StakeCandidate> = Vec::new();
        for limits in self
            .cfg
            .limits
            .iter()
            .filter(|l| l.profile <= self.cfg.risk_profile)
        {
            let ceiling = limits.bankroll_cap.min(kelly::kelly_stake(
                win_prob,
                self.cfg.payout_odds,
                limits.kelly_multiplier,
            ));
            let amount = seq_stake.min(bankroll * ceiling);
            if amount <= 0.0 {
                continue;
            }
            if self.state.cumulative_risked + amount > bankroll {
                return Proposal::Blocked(WagerStatus::InsufficientBankroll);
            }
            let fraction = amount / bankroll;
            let log_growth = kelly::expected_log_growth(win_prob, self.cfg.payout_odds, fraction);
            if log_growth <= 0.0 {
                continue;
            }
            ranked.push(StakeCandidate {
                profile: limits.profile,
                amount,
                fraction,
                kelly_fraction: full_kelly,
                log_growth,
                score: confidence * log_growth,
            });
        }
        if ranked.is_empty() {
            return Proposal::NoEdge;
        }
        // stable sort keeps lower-risk profiles first on equal scores
        ranked.sort_by_key(|c| c.profile);
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        Proposal::Stake(ranked)
    }

    /// Take a paper position. Returns false when one is already open or the
    /// stake would breach the bankroll.
    pub fn open(&mut self, round_id: &str, tick: u32, horizon: u32, candidate: &StakeCandidate) -> bool {
        if self.state.open.is_some() || self.state.status != WagerStatus::Ready {
            return false;
        }
        if self.state.cumulative_risked + candidate.amount > self.state.bankroll {
            self.state.status = WagerStatus::InsufficientBankroll;
            return false;
        }
        self.state.cumulative_risked += candidate.amount;
        self.state.phase = SequencePhase::Staked;
        self.state.open = Some(OpenStake {
            round_id: round_id.to_string(),
            entry_tick: tick,
            target_tick: tick.saturating_add(horizon),
            amount: candidate.amount,
            profile: candidate.profile,
        });
        info!(
            round = round_id,
            tick,
            amount = candidate.amount,
            profile = candidate.profile.as_str(),
            level = self.state.sequence_level,
            "Paper stake opened"
        );
        true
    }

    /// Resolve a win once the live round reaches the target tick.
    pub fn on_tick(&mut self, round_id: &str, tick: u32) -> Option<StakeResult> {
        let hit = matches!(&self.state.open, Some(o) if o.round_id == round_id && tick >= o.target_tick);
        hit.then(|| self.settle(StakeResult::Won))
    }

    pub fn on_round_end(&mut self, round_id: &str, final_tick: u32) -> Option<StakeResult> {
        let target = match &self.state.open {
            Some(o) if o.round_id == round_id => o.target_tick,
            _ => return None,
        };
        let result = if final_tick >= target {
            StakeResult::Won
        } else {
            StakeResult::Lost
        };
        Some(self.settle(result))
    }

    /// The round was discarded without a trustworthy ending.
    pub fn on_round_abandoned(&mut self, round_id: &str) -> Option<StakeResult> {
        let hit = matches!(&self.state.open, Some(o) if o.round_id == round_id);
        hit.then(|| self.settle(StakeResult::Void))
    }

    /// Restore the initial bankroll and the start of the sequence.
    pub fn reset(&mut self) {
        info!(
            bankroll = self.state.bankroll,
            level = self.state.sequence_level,
            "Wager state reset"
        );
        self.state = fresh_state(&self.cfg, &self.sequence);
    }

    /// Start the stake table over after exhaustion, keeping the bankroll.
    /// Returns false when the bankroll is what blocks staking.
    pub fn restart_sequence(&mut self) -> bool {
        if self.state.status == WagerStatus::InsufficientBankroll {
            return false;
        }
        self.state.sequence_level = 0;
        self.state.status = WagerStatus::Ready;
        true
    }

    fn settle(&mut self, result: StakeResult) -> StakeResult {
        let Some(open) = self.state.open.take() else {
            return result;
        };
        self.state.cumulative_risked = (self.state.cumulative_risked - open.amount).max(0.0);
        match result {
            StakeResult::Won => {
                self.state.bankroll += open.amount * self.cfg.payout_odds;
                self.state.sequence_level = 0;
                self.state.wins += 1;
            }
            StakeResult::Lost => {
                self.state.bankroll -= open.amount;
                self.state.sequence_level += 1;
                self.state.losses += 1;
                if self.state.sequence_level >= self.sequence.len() {
                    self.state.status = WagerStatus::SequenceExhausted;
                    warn!(
                        level = self.state.sequence_level,
                        "Stake sequence exhausted; reset required"
                    );
                }
            }
            StakeResult::Void => {}
        }
        if self.state.status == WagerStatus::Ready && self.state.bankroll < self.cfg.base_stake {
            self.state.status = WagerStatus::InsufficientBankroll;
            warn!(bankroll = self.state.bankroll, "Bankroll below base stake; reset required");
        }
        self.state.phase = SequencePhase::Resolved;
        self.state.last_result = Some(result);
        info!(
            round = %open.round_id,
            result = ?result,
            bankroll = self.state.bankroll,
            level = self.state.sequence_level,
            "Paper stake settled"
        );
        result
    }
}

fn fresh_state(cfg: &WagerConfig, sequence: &StakeSequence) -> WagerState {
    WagerState {
        bankroll: cfg.initial_bankroll,
        sequence_level: 0,
        stake_sequence: sequence.stakes().to_vec(),
        cumulative_risked: 0.0,
        risk_profile: cfg.risk_profile,
        phase: SequencePhase::Idle,
        status: WagerStatus::Ready,
        open: None,
        last_result: None,
        wins: 0,
        losses: 0,
    }
}

pub fn default_limits(caps: [f64; 3]) -> Vec<ProfileLimits> {
    const MULTIPLIERS: [f64; 3] = [0.25, 0.5, 1.0];
    RiskProfile::ALL
        .iter()
        .zip(caps.iter().zip(MULTIPLIERS.iter()))
        .map(|(profile, (cap, mult))| ProfileLimits {
            profile: *profile,
            bankroll_cap: *cap,
            kelly_multiplier: *mult,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const UNITS: [f64; 12] = [1.0, 1.0, 1.0, 1.0, 1.0, 2.0, 3.0, 4.0, 6.0, 9.0, 13.0, 19.0];

    fn engine(bankroll: f64, base: f64, profile: RiskProfile) -> WagerSequenceEngine {
        let cfg = WagerConfig {
            initial_bankroll: bankroll,
            base_stake: base,
            payout_odds: 1.0,
            risk_profile: profile,
            limits: default_limits([0.02, 0.05, 0.10]),
        };
        let seq = StakeSequence::new(&UNITS, base, 0).unwrap();
        WagerSequenceEngine::new(cfg, seq)
    }

    fn best(p: &Proposal) -> StakeCandidate {
        match p {
            Proposal::Stake(c) => c[0],
            other => panic!("expected stake, got {:?}", other),
        }
    }

    #[test]
    fn sequence_rejects_decreasing_or_empty_tables() {
        assert_eq!(
            StakeSequence::new(&[1.0, 2.0, 1.0], 0.1, 0).unwrap_err(),
            StakeSequenceError::NonMonotonic { index: 2 }
        );
        assert_eq!(
            StakeSequence::new(&[], 0.1, 0).unwrap_err(),
            StakeSequenceError::Empty
        );
        assert_eq!(
            StakeSequence::new(&[1.0, 0.0], 0.1, 0).unwrap_err(),
            StakeSequenceError::NonPositive { index: 1 }
        );
        assert_eq!(StakeSequence::new(&UNITS, 0.1, 5).unwrap().len(), 5);
    }

    #[test]
    fn no_edge_yields_no_stake() {
        let e = engine(1.0, 0.001, RiskProfile::Aggressive);
        assert_eq!(e.propose(0.5, 1.0), Proposal::NoEdge);
        assert_eq!(e.propose(0.2, 1.0), Proposal::NoEdge);
    }

    #[test]
    fn equal_scores_prefer_lower_risk_profile() {
        // sequence stake is far below every cap, so all profiles size the same
        let e = engine(100.0, 0.001, RiskProfile::Aggressive);
        let c = best(&e.propose(0.9, 0.8));
        assert_eq!(c.profile, RiskProfile::Conservative);
        assert_relative_eq!(c.amount, 0.001, epsilon = 1e-12);
    }

    #[test]
    fn configured_profile_limits_ranking() {
        let e = engine(1.0, 0.05, RiskProfile::Conservative);
        match e.propose(0.9, 1.0) {
            Proposal::Stake(c) => {
                assert!(c.iter().all(|x| x.profile == RiskProfile::Conservative));
                // capped at 2% of bankroll
                assert_relative_eq!(c[0].amount, 0.02, epsilon = 1e-12);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn thin_edge_is_sized_by_fractional_kelly() {
        // full Kelly at p = 0.52, even odds, is 4% of bankroll
        let e = engine(1.0, 0.5, RiskProfile::Aggressive);
        let Proposal::Stake(c) = e.propose(0.52, 1.0) else {
            panic!("expected stakes");
        };
        for cand in &c {
            let mult = match cand.profile {
                RiskProfile::Conservative => 0.25,
                RiskProfile::Moderate => 0.5,
                RiskProfile::Aggressive => 1.0,
            };
            assert_relative_eq!(cand.amount, 0.04 * mult, epsilon = 1e-9);
            assert_relative_eq!(cand.kelly_fraction, 0.04, epsilon = 1e-9);
        }
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn loss_advances_level_and_win_resets_it() {
        let mut e = engine(1.0, 0.001, RiskProfile::Moderate);
        let c = best(&e.propose(0.9, 1.0));
        assert!(e.open("r1", 50, 40, &c));
        assert!(!e.open("r1", 51, 40, &c));
        assert_eq!(e.state().phase, SequencePhase::Staked);
        assert_eq!(e.on_round_end("r1", 70), Some(StakeResult::Lost));
        assert_eq!(e.state().sequence_level, 1);
        assert_relative_eq!(e.state().bankroll, 0.999, epsilon = 1e-12);
        assert_relative_eq!(e.state().cumulative_risked, 0.0, epsilon = 1e-12);

        let c = best(&e.propose(0.9, 1.0));
        assert!(e.open("r2", 10, 40, &c));
        assert_eq!(e.on_tick("r2", 49), None);
        assert_eq!(e.on_tick("r2", 50), Some(StakeResult::Won));
        assert_eq!(e.state().sequence_level, 0);
        assert_eq!(e.state().phase, SequencePhase::Resolved);
    }

    #[test]
    fn sequence_exhaustion_requires_reset() {
        let mut e = engine(10.0, 0.001, RiskProfile::Moderate);
        for i in 0..UNITS.len() {
            let c = best(&e.propose(0.9, 1.0));
            let round = format!("r{}", i);
            assert!(e.open(&round, 20, 40, &c));
            e.on_round_end(&round, 21);
        }
        assert_eq!(e.state().status, WagerStatus::SequenceExhausted);
        assert_eq!(
            e.propose(0.99, 1.0),
            Proposal::Blocked(WagerStatus::SequenceExhausted)
        );
        e.reset();
        assert_eq!(e.state().status, WagerStatus::Ready);
        assert_relative_eq!(e.state().bankroll, 10.0, epsilon = 1e-12);
    }

    #[test]
    fn restart_keeps_bankroll_after_exhaustion() {
        let mut e = engine(10.0, 0.001, RiskProfile::Moderate);
        for i in 0..UNITS.len() {
            let c = best(&e.propose(0.9, 1.0));
            let round = format!("r{}", i);
            e.open(&round, 20, 40, &c);
            e.on_round_end(&round, 21);
        }
        let bankroll = e.state().bankroll;
        assert_eq!(e.state().status, WagerStatus::SequenceExhausted);
        assert!(e.restart_sequence());
        assert_eq!(e.state().status, WagerStatus::Ready);
        assert_eq!(e.state().sequence_level, 0);
        assert_relative_eq!(e.state().bankroll, bankroll, epsilon = 1e-12);
    }

    #[test]
    fn stakes_never_exceed_bankroll() {
        let mut e = engine(0.01, 0.004, RiskProfile::Aggressive);
        for i in 0..50 {
            match e.propose(0.95, 1.0) {
                Proposal::Stake(c) => {
                    let before = e.state().bankroll;
                    assert!(e.state().cumulative_risked + c[0].amount <= before);
                    let round = format!("r{}", i);
                    e.open(&round, 5, 40, &c[0]);
                    assert!(e.state().cumulative_risked <= e.state().bankroll);
                    e.on_round_end(&round, 6);
                }
                Proposal::Blocked(s) => {
                    assert_eq!(s, WagerStatus::InsufficientBankroll);
                    break;
                }
                Proposal::NoEdge => unreachable!(),
            }
        }
        assert_eq!(e.state().status, WagerStatus::InsufficientBankroll);
    }

    #[test]
    fn abandoned_round_voids_the_stake() {
        let mut e = engine(1.0, 0.001, RiskProfile::Moderate);
        let c = best(&e.propose(0.9, 1.0));
        e.open("r1", 5, 40, &c);
        assert_eq!(e.on_round_abandoned("r1"), Some(StakeResult::Void));
        assert_relative_eq!(e.state().bankroll, 1.0, epsilon = 1e-12);
        assert_eq!(e.state().sequence_level, 0);
    }
}

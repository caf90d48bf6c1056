use clap::Parser;
use std::time::Duration;

use crate::bot::backtest::BacktestConfig;
use crate::bot::patterns::PatternConfig;
use crate::bot::wager::{default_limits, ProfileLimits, RiskProfile, StakeSequence, WagerConfig};
use crate::bot::zones::{PriorPeakHeuristic, ZoneTable};
use crate::bot::EngineConfig;
use crate::game::PhaseConfig;

/// Crash-game round tracker and wager advisor
#[derive(Parser, Debug, Clone)]
#[command(name = "rugwatch", version, about)]
pub struct Config {
    // ── Feed ─────────────────────────────────────────────────────────────────
    /// Game feed WebSocket URL
    #[arg(
        long,
        env = "FEED_URL",
        default_value = "wss://backend.rugs.fun/socket.io/?EIO=4&transport=websocket"
    )]
    pub feed_url: String,

    /// Socket.IO event carrying game snapshots
    #[arg(long, env = "FEED_EVENT", default_value = "gameStateUpdate")]
    pub feed_event: String,

    /// Replay snapshots from a JSONL file instead of connecting
    #[arg(long, env = "REPLAY_FILE")]
    pub replay_file: Option<String>,

    /// Delay between replayed snapshots (0 = as fast as possible)
    #[arg(long, env = "REPLAY_INTERVAL_MS", default_value = "0")]
    pub replay_interval_ms: u64,

    // ── Storage & dashboard ──────────────────────────────────────────────────
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "rugwatch.db")]
    pub database_path: String,

    /// Run without persistence
    #[arg(long, env = "NO_PERSIST", default_value = "false")]
    pub no_persist: bool,

    /// Persisted rounds used to pre-seed the windows at startup
    #[arg(long, env = "HISTORY_PRELOAD", default_value = "100")]
    pub history_preload: usize,

    /// Dashboard listen address
    #[arg(long, env = "DASHBOARD_ADDR", default_value = "0.0.0.0:8080")]
    pub dashboard_addr: String,

    // ── Rounds & statistics ──────────────────────────────────────────────────
    /// Rolling window capacities (completed rounds)
    #[arg(long, env = "WINDOW_SIZES", value_delimiter = ',', default_value = "10,25,50,100")]
    pub window_sizes: Vec<usize>,

    /// Window the survival estimate is taken from
    #[arg(long, env = "DECISION_WINDOW", default_value = "100")]
    pub decision_window: usize,

    /// Completed rounds required before any recommendation
    #[arg(long, env = "WARMUP_RECORDS", default_value = "20")]
    pub warmup_records: usize,

    /// Rounds ending at or below this tick are early terminations
    #[arg(long, env = "EARLY_TERMINATION_TICKS", default_value = "10")]
    pub early_termination_ticks: u32,

    /// Hard cap on round length in ticks
    #[arg(long, env = "MAX_ROUND_TICKS", default_value = "5000")]
    pub max_round_ticks: u32,

    /// Countdown below which the presale window counts as open
    #[arg(long, env = "PRESALE_THRESHOLD_MS", default_value = "10000")]
    pub presale_threshold_ms: u64,

    /// How long to wait for the second end-of-round event
    #[arg(long, env = "PAIRING_TIMEOUT_MS", default_value = "3000")]
    pub pairing_timeout_ms: u64,

    /// Feed silence after which the tracker goes stale
    #[arg(long, env = "STALE_AFTER_MS", default_value = "5000")]
    pub stale_after_ms: u64,

    /// Decision horizon in ticks
    #[arg(long, env = "HORIZON_TICKS", default_value = "40")]
    pub horizon_ticks: u32,

    /// Horizons reported by the calibration tracker
    #[arg(long, env = "CALIBRATION_HORIZONS", value_delimiter = ',', default_value = "10,20,40,80")]
    pub calibration_horizons: Vec<u32>,

    // ── Patterns ─────────────────────────────────────────────────────────────
    #[arg(long, env = "PATTERN_WINDOW", default_value = "8")]
    pub pattern_window: usize,

    #[arg(long, env = "VOLATILITY_SPIKE_MULTIPLIER", default_value = "2.5")]
    pub volatility_spike_multiplier: f64,

    #[arg(long, env = "STAGNATION_TICKS", default_value = "10")]
    pub stagnation_ticks: usize,

    #[arg(long, env = "STAGNATION_FRACTION", default_value = "0.005")]
    pub stagnation_fraction: f64,

    #[arg(long, env = "REBOUND_LOOKBACK", default_value = "20")]
    pub rebound_lookback: usize,

    #[arg(long, env = "REBOUND_FRACTION", default_value = "0.10")]
    pub rebound_fraction: f64,

    /// Enable the (unvalidated) prior-round peak heuristic
    #[arg(long, env = "PRIOR_PEAK_CONDITIONING", default_value = "false")]
    pub prior_peak_conditioning: bool,

    #[arg(long, env = "PRIOR_PEAK_THRESHOLD", default_value = "10.0")]
    pub prior_peak_threshold: f64,

    // ── Wager ────────────────────────────────────────────────────────────────
    /// Paper bankroll
    #[arg(long, env = "INITIAL_BANKROLL", default_value = "1.0")]
    pub initial_bankroll: f64,

    #[arg(long, env = "BASE_STAKE", default_value = "0.001")]
    pub base_stake: f64,

    /// Stake table in units of the base stake
    #[arg(
        long,
        env = "STAKE_SEQUENCE",
        value_delimiter = ',',
        default_value = "1,1,1,1,1,2,3,4,6,9,13,19"
    )]
    pub stake_sequence: Vec<f64>,

    /// Truncate the stake table (0 = whole table)
    #[arg(long, env = "MAX_SEQUENCE_LENGTH", default_value = "0")]
    pub max_sequence_length: usize,

    /// Net odds paid on a won wager
    #[arg(long, env = "PAYOUT_ODDS", default_value = "1.0")]
    pub payout_odds: f64,

    /// Most aggressive profile the engine may pick
    #[arg(long, env = "RISK_PROFILE", value_enum, default_value = "moderate")]
    pub risk_profile: RiskProfile,

    #[arg(long, env = "CONSERVATIVE_CAP", default_value = "0.02")]
    pub conservative_cap: f64,

    #[arg(long, env = "MODERATE_CAP", default_value = "0.05")]
    pub moderate_cap: f64,

    #[arg(long, env = "AGGRESSIVE_CAP", default_value = "0.10")]
    pub aggressive_cap: f64,

    /// At-risk sample size that counts as full confidence
    #[arg(long, env = "CONFIDENCE_SAMPLE_TARGET", default_value = "50")]
    pub confidence_sample_target: usize,

    /// Wall-clock budget for one decision
    #[arg(long, env = "DECISION_BUDGET_MS", default_value = "25")]
    pub decision_budget_ms: u64,

    // ── Backtest ─────────────────────────────────────────────────────────────
    /// Run the bankroll simulation over persisted rounds, print it and exit
    #[arg(long, env = "BACKTEST", default_value = "false")]
    pub backtest: bool,

    /// Tick at which each simulated wager is placed
    #[arg(long, env = "BACKTEST_ENTRY_TICK", default_value = "20")]
    pub backtest_entry_tick: u32,

    /// Most recent persisted rounds to simulate over
    #[arg(long, env = "BACKTEST_ROUNDS", default_value = "1000")]
    pub backtest_rounds: usize,
}

impl Config {
    /// Reject configurations the core cannot run with. These are the only
    /// fatal errors.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_sizes.is_empty() || self.window_sizes.iter().any(|s| *s == 0) {
            anyhow::bail!("window_sizes must be non-empty and every size positive");
        }
        if !self.window_sizes.contains(&self.decision_window) {
            anyhow::bail!(
                "decision_window {} is not one of the window sizes {:?}",
                self.decision_window,
                self.window_sizes
            );
        }
        if self.warmup_records == 0 || self.warmup_records > self.max_window() {
            anyhow::bail!("warmup_records must be between 1 and the largest window");
        }
        if self.horizon_ticks == 0 {
            anyhow::bail!("horizon_ticks must be positive");
        }
        if self.calibration_horizons.is_empty() {
            anyhow::bail!("calibration_horizons must not be empty");
        }
        if self.early_termination_ticks >= self.max_round_ticks {
            anyhow::bail!("early_termination_ticks must be below max_round_ticks");
        }
        if self.pattern_window == 0 {
            anyhow::bail!("pattern_window must be positive");
        }
        if !(self.volatility_spike_multiplier > 1.0) {
            anyhow::bail!("volatility_spike_multiplier must be greater than 1.0");
        }
        if !(0.0..1.0).contains(&self.stagnation_fraction) {
            anyhow::bail!("stagnation_fraction must be in [0, 1)");
        }
        if !(self.rebound_fraction > 0.0) {
            anyhow::bail!("rebound_fraction must be positive");
        }
        if !(self.initial_bankroll > 0.0) {
            anyhow::bail!("initial_bankroll must be positive");
        }
        if !(self.base_stake > 0.0) || self.base_stake > self.initial_bankroll {
            anyhow::bail!("base_stake must be positive and no larger than the bankroll");
        }
        if !(self.payout_odds > 0.0) {
            anyhow::bail!("payout_odds must be positive");
        }
        for (name, cap) in [
            ("conservative_cap", self.conservative_cap),
            ("moderate_cap", self.moderate_cap),
            ("aggressive_cap", self.aggressive_cap),
        ] {
            if !(cap > 0.0 && cap < 1.0) {
                anyhow::bail!("{} must be in (0, 1)", name);
            }
        }
        if self.replay_file.is_none() {
            let url = url::Url::parse(&self.feed_url)
                .map_err(|e| anyhow::anyhow!("feed_url {:?} is invalid: {}", self.feed_url, e))?;
            if !matches!(url.scheme(), "ws" | "wss") {
                anyhow::bail!("feed_url must use ws:// or wss://, got {}", url.scheme());
            }
        }
        if self.backtest_rounds == 0 {
            anyhow::bail!("backtest_rounds must be positive");
        }
        if self.decision_budget_ms == 0 {
            anyhow::bail!("decision_budget_ms must be positive");
        }
        self.stake_sequence()?;
        self.zone_table()?;
        Ok(())
    }

    fn max_window(&self) -> usize {
        self.window_sizes.iter().copied().max().unwrap_or(0)
    }

    pub fn stake_sequence(&self) -> anyhow::Result<StakeSequence> {
        Ok(StakeSequence::new(
            &self.stake_sequence,
            self.base_stake,
            self.max_sequence_length,
        )?)
    }

    pub fn zone_table(&self) -> anyhow::Result<ZoneTable> {
        Ok(ZoneTable::standard(self.payout_odds)?)
    }

    pub fn profile_limits(&self) -> Vec<ProfileLimits> {
        default_limits([self.conservative_cap, self.moderate_cap, self.aggressive_cap])
    }

    pub fn phase_config(&self) -> PhaseConfig {
        PhaseConfig {
            presale_threshold_ms: self.presale_threshold_ms,
            pairing_timeout: Duration::from_millis(self.pairing_timeout_ms),
            early_termination_ticks: self.early_termination_ticks,
            max_round_ticks: self.max_round_ticks,
        }
    }

    pub fn pattern_config(&self) -> PatternConfig {
        PatternConfig {
            early_termination_ticks: self.early_termination_ticks,
            window: self.pattern_window,
            spike_multiplier: self.volatility_spike_multiplier,
            stagnation_ticks: self.stagnation_ticks,
            stagnation_fraction: self.stagnation_fraction,
            rebound_lookback: self.rebound_lookback,
            rebound_fraction: self.rebound_fraction,
        }
    }

    pub fn prior_peak(&self) -> Option<PriorPeakHeuristic> {
        self.prior_peak_conditioning.then_some(PriorPeakHeuristic {
            threshold: self.prior_peak_threshold,
        })
    }

    pub fn wager_config(&self) -> WagerConfig {
        WagerConfig {
            initial_bankroll: self.initial_bankroll,
            base_stake: self.base_stake,
            payout_odds: self.payout_odds,
            risk_profile: self.risk_profile,
            limits: self.profile_limits(),
        }
    }

    pub fn backtest_config(&self) -> anyhow::Result<BacktestConfig> {
        Ok(BacktestConfig {
            entry_tick: self.backtest_entry_tick,
            horizon_ticks: self.horizon_ticks,
            decision_window: self.decision_window,
            warmup_records: self.warmup_records,
            max_rounds: self.backtest_rounds,
            wager: self.wager_config(),
            sequence: self.stake_sequence()?,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            decision_window: self.decision_window,
            horizon_ticks: self.horizon_ticks,
            confidence_sample_target: self.confidence_sample_target,
            decision_budget: Duration::from_millis(self.decision_budget_ms),
            stale_after: Duration::from_millis(self.stale_after_ms),
        }
    }
}

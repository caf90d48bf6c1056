//! Walk-forward bankroll simulation over completed rounds.
//!
//! Each round is offered one paper wager at `entry_tick`: survive another
//! `horizon_ticks`. The survival estimate comes only from rounds that finished
//! earlier, so the run never sees its own future. A flat-stake ledger is run
//! next to one progressive ledger per permitted risk profile.

use serde::Serialize;
use tracing::info;

use super::wager::{
    Proposal, StakeResult, StakeSequence, WagerConfig, WagerSequenceEngine, WagerStatus,
};
use crate::db::models::GameRecord;
use crate::stats::{RollingWindowStatistics, Survival};

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub entry_tick: u32,
    pub horizon_ticks: u32,
    pub decision_window: usize,
    pub warmup_records: usize,
    /// Persisted rounds loaded per run
    pub max_rounds: usize,
    pub wager: WagerConfig,
    pub sequence: StakeSequence,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyResult {
    pub strategy: String,
    pub bets: u32,
    pub wins: u32,
    pub losses: u32,
    /// Eligible rounds with no edge at the entry tick
    pub skipped: u32,
    pub final_bankroll: f64,
    pub profit: f64,
    /// Largest peak-to-trough loss as a fraction of the peak
    pub max_drawdown: f64,
    /// Times the stake table ran out and started over
    pub exhaustions: u32,
    pub ruined: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestReport {
    pub rounds: usize,
    /// Rounds that reached the entry tick with a defined survival estimate
    pub eligible: usize,
    pub entry_tick: u32,
    pub horizon_ticks: u32,
    pub results: Vec<StrategyResult>,
}

struct Ledger {
    name: String,
    engine: WagerSequenceEngine,
    progressive: bool,
    peak: f64,
    max_drawdown: f64,
    skipped: u32,
    exhaustions: u32,
}

impl Ledger {
    fn new(name: String, engine: WagerSequenceEngine, progressive: bool) -> Self {
        let peak = engine.state().bankroll;
        Ledger {
            name,
            engine,
            progressive,
            peak,
            max_drawdown: 0.0,
            skipped: 0,
            exhaustions: 0,
        }
    }

    fn ruined(&self) -> bool {
        self.engine.state().status == WagerStatus::InsufficientBankroll
    }

    fn play(&mut self, record: &GameRecord, entry: u32, horizon: u32, p: f64) {
        if self.ruined() {
            return;
        }
        let best = match self.engine.propose(p, 1.0) {
            Proposal::Stake(ranked) => ranked[0],
            Proposal::NoEdge => {
                self.skipped += 1;
                return;
            }
            Proposal::Blocked(_) => return,
        };
        if !self.engine.open(&record.round_id, entry, horizon, &best) {
            return;
        }
        if self.engine.on_round_end(&record.round_id, record.duration_ticks)
            == Some(StakeResult::Lost)
            && self.engine.state().status == WagerStatus::SequenceExhausted
        {
            if self.progressive {
                self.exhaustions += 1;
            }
            self.engine.restart_sequence();
        }

        let bankroll = self.engine.state().bankroll;
        self.peak = self.peak.max(bankroll);
        if self.peak > 0.0 {
            self.max_drawdown = self.max_drawdown.max((self.peak - bankroll) / self.peak);
        }
    }

    fn finish(self, initial: f64) -> StrategyResult {
        let ruined = self.ruined();
        let state = self.engine.state();
        StrategyResult {
            strategy: self.name,
            bets: state.wins + state.losses,
            wins: state.wins,
            losses: state.losses,
            skipped: self.skipped,
            final_bankroll: state.bankroll,
            profit: state.bankroll - initial,
            max_drawdown: self.max_drawdown,
            exhaustions: self.exhaustions,
            ruined,
        }
    }
}

fn ledgers(cfg: &BacktestConfig) -> Vec<Ledger> {
    let mut out = Vec::new();
    // a one-entry table never escalates
    if let Ok(flat) = StakeSequence::new(&[1.0], cfg.wager.base_stake, 0) {
        out.push(Ledger::new(
            "fixed".to_string(),
            WagerSequenceEngine::new(cfg.wager.clone(), flat),
            false,
        ));
    }
    for limits in cfg
        .wager
        .limits
        .iter()
        .filter(|l| l.profile <= cfg.wager.risk_profile)
    {
        let wager = WagerConfig {
            risk_profile: limits.profile,
            limits: vec![*limits],
            ..cfg.wager.clone()
        };
        out.push(Ledger::new(
            format!("progressive_{}", limits.profile.as_str()),
            WagerSequenceEngine::new(wager, cfg.sequence.clone()),
            true,
        ));
    }
    out
}

/// Replay `records` (oldest first) through every ledger.
pub fn run_backtest(records: &[GameRecord], cfg: &BacktestConfig) -> BacktestReport {
    let mut stats = RollingWindowStatistics::new(&[cfg.decision_window], cfg.warmup_records);
    let mut ledgers = ledgers(cfg);
    let mut eligible = 0;

    for record in records {
        if stats.is_warm() && record.duration_ticks >= cfg.entry_tick {
            if let Survival::Defined { probability, .. } =
                stats.forward_survival(cfg.decision_window, cfg.entry_tick, cfg.horizon_ticks)
            {
                eligible += 1;
                for ledger in ledgers.iter_mut() {
                    ledger.play(record, cfg.entry_tick, cfg.horizon_ticks, probability);
                }
            }
        }
        stats.insert(record);
    }

    let results: Vec<StrategyResult> = ledgers
        .into_iter()
        .map(|l| l.finish(cfg.wager.initial_bankroll))
        .collect();
    for r in &results {
        info!(
            strategy = %r.strategy,
            bets = r.bets,
            bankroll = r.final_bankroll,
            drawdown = r.max_drawdown,
            exhaustions = r.exhaustions,
            "Backtest finished"
        );
    }
    BacktestReport {
        rounds: records.len(),
        eligible,
        entry_tick: cfg.entry_tick,
        horizon_ticks: cfg.horizon_ticks,
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::wager::{default_limits, RiskProfile};
    use crate::db::models::VolatilitySummary;
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn rec(id: usize, duration: u32) -> GameRecord {
        GameRecord {
            round_id: format!("g{}", id),
            duration_ticks: duration,
            peak_value: 1.5,
            final_value: 0.0,
            is_early_termination: duration <= 10,
            volatility: VolatilitySummary::default(),
            trade_volume: 0.0,
            incomplete: false,
            revealed_seed: None,
            completed_at: Utc::now(),
        }
    }

    fn cfg() -> BacktestConfig {
        BacktestConfig {
            entry_tick: 10,
            horizon_ticks: 10,
            decision_window: 20,
            warmup_records: 5,
            max_rounds: 1000,
            wager: WagerConfig {
                initial_bankroll: 1.0,
                base_stake: 0.001,
                payout_odds: 1.0,
                risk_profile: RiskProfile::Moderate,
                limits: default_limits([0.02, 0.05, 0.10]),
            },
            sequence: StakeSequence::new(&[1.0, 2.0, 4.0], 0.001, 0).unwrap(),
        }
    }

    fn result<'a>(report: &'a BacktestReport, name: &str) -> &'a StrategyResult {
        report
            .results
            .iter()
            .find(|r| r.strategy == name)
            .unwrap_or_else(|| panic!("no {} result", name))
    }

    #[test]
    fn ledgers_follow_the_configured_profile() {
        let report = run_backtest(&[], &cfg());
        let names: Vec<&str> = report.results.iter().map(|r| r.strategy.as_str()).collect();
        assert_eq!(
            names,
            vec!["fixed", "progressive_conservative", "progressive_moderate"]
        );
        assert_eq!(report.eligible, 0);
    }

    #[test]
    fn long_rounds_win_every_bet_after_warmup() {
        let records: Vec<GameRecord> = (0..30).map(|i| rec(i, 100)).collect();
        let report = run_backtest(&records, &cfg());
        assert_eq!(report.eligible, 25);
        for r in &report.results {
            assert_eq!(r.wins, 25, "{}", r.strategy);
            assert_eq!(r.losses, 0);
            assert_relative_eq!(r.final_bankroll, 1.025, epsilon = 1e-9);
            assert_relative_eq!(r.max_drawdown, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn losing_streak_exhausts_progression_but_not_flat_stakes() {
        // twenty survivors, then rounds that reach the entry tick and die
        // before the target
        let mut records: Vec<GameRecord> = (0..20).map(|i| rec(i, 100)).collect();
        records.extend((20..35).map(|i| rec(i, 15)));
        let report = run_backtest(&records, &cfg());

        let fixed = result(&report, "fixed");
        assert_eq!(fixed.wins, 15);
        // the edge disappears once half the window has died early
        assert_eq!(fixed.losses, 10);
        assert_eq!(fixed.skipped, 5);
        assert_eq!(fixed.exhaustions, 0);
        assert_relative_eq!(fixed.final_bankroll, 1.005, epsilon = 1e-9);

        let prog = result(&report, "progressive_moderate");
        assert_eq!(prog.losses, 10);
        assert_eq!(prog.exhaustions, 3);
        assert_relative_eq!(prog.final_bankroll, 0.993, epsilon = 1e-9);
        assert!(prog.max_drawdown > fixed.max_drawdown);
        assert!(!prog.ruined);
    }

    #[test]
    fn rounds_ending_before_entry_are_not_offered() {
        let mut records: Vec<GameRecord> = (0..10).map(|i| rec(i, 100)).collect();
        records.extend((10..15).map(|i| rec(i, 5)));
        let report = run_backtest(&records, &cfg());
        assert_eq!(report.rounds, 15);
        assert_eq!(report.eligible, 5);
        assert_eq!(result(&report, "fixed").bets, 5);
    }
}

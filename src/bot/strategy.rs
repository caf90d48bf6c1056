use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::db::models::{Action, GameRecord, Recommendation};
use crate::db::PersistCommand;
use crate::feed::FeedMessage;
use crate::game::{normalize, Phase, PhaseEvent, PhaseStateMachine};
use crate::stats::{RollingWindowStatistics, Survival, WindowSummary};

use super::calibration::CalibrationInput;
use super::patterns::{PatternDetector, PatternFlags};
use super::wager::{Proposal, StakeCandidate, WagerSequenceEngine, WagerState};
use super::zones::{Posture, RiskZone, RiskZoneClassifier};

/// Commands from outside the engine task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    ResetWager,
}

/// Outcome of the decision stage for the latest event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Advice {
    /// Not enough completed rounds yet
    InsufficientData { available: usize, required: usize },
    /// No live round to advise on (or the feed is stale)
    Suppressed { reason: String },
    /// No historical round reached this tick
    NoEvidence { tick: u32 },
    /// Decision ran past its budget and was dropped for this tick
    Skipped { elapsed_ms: u64 },
    Recommend(Recommendation),
}

/// Everything refused, repaired or dropped, for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub snapshots: u64,
    pub malformed: u64,
    pub duplicates: u64,
    pub ordering_anomalies: u64,
    pub degraded_commits: u64,
    pub discarded_rounds: u64,
    pub skipped_decisions: u64,
    pub records_committed: u64,
    pub dropped_outbound: u64,
}

/// Read model pushed to the dashboard after every processed event.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub phase: Phase,
    pub round_id: Option<String>,
    pub tick: u32,
    pub price: f64,
    pub cooldown_ms: u64,
    pub zone: Option<RiskZone>,
    pub patterns: PatternFlags,
    pub advice: Advice,
    pub latest_recommendation: Option<Recommendation>,
    pub candidates: Vec<StakeCandidate>,
    pub wager: WagerState,
    pub windows: Vec<WindowSummary>,
    pub last_record: Option<GameRecord>,
    pub diagnostics: Diagnostics,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub decision_window: usize,
    pub horizon_ticks: u32,
    pub confidence_sample_target: usize,
    pub decision_budget: Duration,
    pub stale_after: Duration,
}

/// Outbound queues. Each is optional so the core runs without persistence
/// or calibration.
#[derive(Default)]
pub struct EngineOutputs {
    pub persist: Option<mpsc::Sender<PersistCommand>>,
    pub calibration: Option<mpsc::Sender<CalibrationInput>>,
}

/// Single owner of the live round, the windows and the wager state. Every
/// inbound message is handled to completion before the next one.
pub struct AdvisorEngine {
    config: EngineConfig,
    machine: PhaseStateMachine,
    stats: RollingWindowStatistics,
    detector: PatternDetector,
    classifier: RiskZoneClassifier,
    wager: WagerSequenceEngine,
    outputs: EngineOutputs,
    snapshot_tx: watch::Sender<DashboardSnapshot>,
    diagnostics: Diagnostics,
    last_message_at: Option<Instant>,
    advice: Advice,
    zone: Option<RiskZone>,
    patterns: PatternFlags,
    candidates: Vec<StakeCandidate>,
    latest_recommendation: Option<Recommendation>,
}

impl AdvisorEngine {
    pub fn new(
        config: EngineConfig,
        machine: PhaseStateMachine,
        stats: RollingWindowStatistics,
        detector: PatternDetector,
        classifier: RiskZoneClassifier,
        wager: WagerSequenceEngine,
        outputs: EngineOutputs,
    ) -> (Self, watch::Receiver<DashboardSnapshot>) {
        let advice = Advice::Suppressed {
            reason: "waiting for feed".into(),
        };
        let initial = DashboardSnapshot {
            phase: machine.phase(),
            round_id: None,
            tick: 0,
            price: 0.0,
            cooldown_ms: 0,
            zone: None,
            patterns: PatternFlags::default(),
            advice: advice.clone(),
            latest_recommendation: None,
            candidates: Vec::new(),
            wager: wager.state().clone(),
            windows: stats.summaries(),
            last_record: stats.last_record().cloned(),
            diagnostics: Diagnostics::default(),
            updated_at: Utc::now(),
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let engine = AdvisorEngine {
            config,
            machine,
            stats,
            detector,
            classifier,
            wager,
            outputs,
            snapshot_tx,
            diagnostics: Diagnostics::default(),
            last_message_at: None,
            advice,
            zone: None,
            patterns: PatternFlags::default(),
            candidates: Vec::new(),
            latest_recommendation: None,
        };
        (engine, snapshot_rx)
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.machine.phase()
    }

    #[cfg(test)]
    pub fn stats(&self) -> &RollingWindowStatistics {
        &self.stats
    }

    #[cfg(test)]
    pub fn wager(&self) -> &WagerState {
        self.wager.state()
    }

    #[cfg(test)]
    pub fn advice(&self) -> &Advice {
        &self.advice
    }

    #[cfg(test)]
    pub fn diagnostics(&self) -> Diagnostics {
        self.merged_diagnostics()
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    pub fn on_feed_message(&mut self, msg: FeedMessage, now: Instant) {
        self.last_message_at = Some(now);
        match msg {
            FeedMessage::Connected { source } => {
                info!("[{}] Feed connected; waiting for a clean round boundary", source);
            }
            FeedMessage::Disconnected { source, reason } => {
                warn!("[{}] Feed disconnected: {}", source, reason);
                let events = self.machine.mark_stale("feed disconnected");
                self.apply_phase_events(events, now);
            }
            FeedMessage::Snapshot(raw) => {
                self.diagnostics.snapshots += 1;
                match normalize(&raw) {
                    Ok(event) => {
                        let events = self.machine.handle(event, now);
                        self.apply_phase_events(events, now);
                    }
                    Err(e) => {
                        self.diagnostics.malformed += 1;
                        warn!("Dropping malformed snapshot: {}", e);
                    }
                }
            }
        }
        self.publish();
    }

    /// Periodic upkeep: the pairing timeout and feed-silence detection.
    pub fn on_timer(&mut self, now: Instant) {
        let mut events = self.machine.poll_timeout(now);
        let silent = self
            .last_message_at
            .is_some_and(|t| now.saturating_duration_since(t) >= self.config.stale_after);
        if silent && self.machine.phase() != Phase::Stale {
            warn!("No feed traffic for {:?}", self.config.stale_after);
            events.extend(self.machine.mark_stale("feed silent"));
        }
        if !events.is_empty() {
            self.apply_phase_events(events, now);
            self.publish();
        }
    }

    pub fn on_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::ResetWager => self.wager.reset(),
        }
        self.publish();
    }

    pub fn preload(&mut self, records: &[GameRecord]) {
        let n = self.stats.preload(records.iter());
        info!(
            "Preloaded {} historical rounds (warm: {})",
            n,
            self.stats.is_warm()
        );
        self.publish();
    }

    // ── Phase events ─────────────────────────────────────────────────────────

    fn apply_phase_events(&mut self, events: Vec<PhaseEvent>, now: Instant) {
        let mut decide = false;
        for ev in events {
            match ev {
                PhaseEvent::RoundStarted { round_id } => {
                    debug!("Tracking round {}", round_id);
                    self.latest_recommendation = None;
                    decide = true;
                }
                PhaseEvent::TickAdvanced { tick } => {
                    let round_id = self.machine.round().round_id().to_string();
                    self.wager.on_tick(&round_id, tick);
                    decide = true;
                }
                PhaseEvent::TerminationObserved {
                    round_id,
                    final_tick,
                } => {
                    self.wager.on_round_end(&round_id, final_tick);
                }
                PhaseEvent::RoundEnded(record) => self.on_round_committed(record),
                PhaseEvent::RoundDiscarded { round_id, reason } => {
                    debug!("Round {} discarded ({})", round_id, reason);
                    self.wager.on_round_abandoned(&round_id);
                    self.send_calibration(CalibrationInput::RoundDiscarded(round_id));
                }
                PhaseEvent::PhaseChanged { from, to } => {
                    info!("Phase {} → {}", from.as_str(), to.as_str());
                }
                PhaseEvent::PresaleOpened | PhaseEvent::PresaleClosed => {}
                PhaseEvent::WentStale { reason } => {
                    debug!("Stale: {}", reason);
                }
            }
        }

        if self.machine.phase() == Phase::Active {
            if decide {
                self.advice = self.decide(now);
            }
        } else {
            self.clear_decision();
            self.advice = Advice::Suppressed {
                reason: format!("phase {}", self.machine.phase().as_str()),
            };
        }
    }

    fn on_round_committed(&mut self, record: GameRecord) {
        self.wager.on_round_end(&record.round_id, record.duration_ticks);
        self.stats.insert(&record);
        self.diagnostics.records_committed += 1;
        self.send_persist(PersistCommand::Record(record.clone()));
        self.send_calibration(CalibrationInput::RoundCommitted(record));
    }

    // ── Decision ─────────────────────────────────────────────────────────────

    /// One decision pass. Elapsed time is checked between stages and an
    /// overrun skips the tick rather than delaying the next event.
    fn decide(&mut self, started: Instant) -> Advice {
        if !self.stats.is_warm() {
            return Advice::InsufficientData {
                available: self.stats.available_records(),
                required: self.stats.warmup_records(),
            };
        }

        let round = self.machine.round();
        let tick = round.current_tick();
        let round_id = round.round_id().to_string();
        let survival =
            self.stats
                .forward_survival(self.config.decision_window, tick, self.config.horizon_ticks);
        let (probability, at_risk) = match survival {
            Survival::Undefined => {
                self.clear_decision();
                return Advice::NoEvidence { tick };
            }
            Survival::Defined {
                probability,
                at_risk,
            } => (probability, at_risk),
        };

        let patterns = self.detector.detect(round);
        if let Some(skip) = self.over_budget(started) {
            return skip;
        }
        if patterns.any() {
            debug!(tick, flags = ?patterns.names(), "Patterns active");
        }

        let prior_peak = self.stats.last_record().map(|r| r.peak_value);
        let zone = *self.classifier.classify(probability, &patterns, prior_peak);
        let margin = self.classifier.table().margin(probability);
        let sample = (at_risk as f64 / self.config.confidence_sample_target.max(1) as f64).min(1.0);
        let confidence = sample * (0.5 + 0.5 * margin);

        let staked = self.wager.is_staked();
        let mut action = match zone.posture {
            Posture::Exit => Action::Exit,
            Posture::Avoid if staked => Action::Reduce,
            Posture::Avoid | Posture::Hold => Action::Hold,
            Posture::Selective if confidence >= 0.5 => Action::Enter,
            Posture::Selective => Action::Hold,
            Posture::Press => Action::Enter,
        };
        if staked && action == Action::Enter {
            action = Action::Hold;
        }

        if let Some(skip) = self.over_budget(started) {
            return skip;
        }

        self.candidates.clear();
        let mut stake = None;
        if action == Action::Enter {
            match self.wager.propose(probability, confidence) {
                Proposal::Stake(ranked) => {
                    let best = ranked[0];
                    if self
                        .wager
                        .open(&round_id, tick, self.config.horizon_ticks, &best)
                    {
                        stake = Some(best);
                    } else {
                        action = Action::Hold;
                    }
                    self.candidates = ranked;
                }
                Proposal::NoEdge => action = Action::Hold,
                Proposal::Blocked(status) => {
                    debug!("Wager blocked: {:?}", status);
                    action = Action::Hold;
                }
            }
        }

        let rec = Recommendation {
            timestamp: Utc::now(),
            tick,
            round_id,
            zone: zone.name,
            patterns: patterns.clone(),
            action,
            confidence,
            suggested_stake: stake.map(|s| s.amount).unwrap_or(0.0),
            profile: stake.map(|s| s.profile),
            survival_probability: probability,
            horizon_ticks: self.config.horizon_ticks,
        };
        debug!(
            tick,
            zone = zone.name.as_str(),
            action = action.as_str(),
            p = probability,
            confidence,
            "Recommendation"
        );
        self.zone = Some(zone);
        self.patterns = patterns;
        self.latest_recommendation = Some(rec.clone());
        self.send_persist(PersistCommand::Recommendation(rec.clone()));
        self.send_calibration(CalibrationInput::Recommendation(rec.clone()));
        Advice::Recommend(rec)
    }

    fn over_budget(&mut self, started: Instant) -> Option<Advice> {
        let elapsed = started.elapsed();
        if elapsed <= self.config.decision_budget {
            return None;
        }
        self.diagnostics.skipped_decisions += 1;
        self.clear_decision();
        warn!("Decision over budget ({:?}); skipping tick", elapsed);
        Some(Advice::Skipped {
            elapsed_ms: elapsed.as_millis() as u64,
        })
    }

    /// Drop the previous tick's zone, flags and candidates.
    fn clear_decision(&mut self) {
        self.zone = None;
        self.patterns = PatternFlags::default();
        self.candidates.clear();
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    fn send_persist(&mut self, cmd: PersistCommand) {
        if let Some(tx) = &self.outputs.persist {
            if tx.try_send(cmd).is_err() {
                self.diagnostics.dropped_outbound += 1;
            }
        }
    }

    fn send_calibration(&mut self, input: CalibrationInput) {
        if let Some(tx) = &self.outputs.calibration {
            if tx.try_send(input).is_err() {
                self.diagnostics.dropped_outbound += 1;
            }
        }
    }

    fn merged_diagnostics(&self) -> Diagnostics {
        let c = self.machine.counters();
        Diagnostics {
            duplicates: c.duplicates,
            ordering_anomalies: c.ordering_anomalies,
            degraded_commits: c.degraded_commits,
            discarded_rounds: c.discarded_rounds,
            ..self.diagnostics
        }
    }

    fn publish(&self) {
        let round = self.machine.round();
        let tracking = round.is_tracking();
        let snapshot = DashboardSnapshot {
            phase: self.machine.phase(),
            round_id: tracking.then(|| round.round_id().to_string()),
            tick: if tracking { round.current_tick() } else { 0 },
            price: if tracking { round.last_price() } else { 0.0 },
            cooldown_ms: self.machine.cooldown_ms(),
            zone: self.zone,
            patterns: self.patterns.clone(),
            advice: self.advice.clone(),
            latest_recommendation: self.latest_recommendation.clone(),
            candidates: self.candidates.clone(),
            wager: self.wager.state().clone(),
            windows: self.stats.summaries(),
            last_record: self.stats.last_record().cloned(),
            diagnostics: self.merged_diagnostics(),
            updated_at: Utc::now(),
        };
        // no receivers is fine
        let _ = self.snapshot_tx.send(snapshot);
    }

    /// Engine task main loop.
    pub async fn run(
        mut self,
        mut feed_rx: mpsc::Receiver<FeedMessage>,
        mut cmd_rx: mpsc::Receiver<EngineCommand>,
        timer_period: Duration,
    ) {
        let mut timer = tokio::time::interval(timer_period);
        info!("Advisor engine started");
        loop {
            tokio::select! {
                msg = feed_rx.recv() => match msg {
                    Some(msg) => self.on_feed_message(msg, Instant::now()),
                    None => {
                        info!("Feed closed; engine stopping");
                        break;
                    }
                },
                Some(cmd) = cmd_rx.recv() => self.on_command(cmd),
                _ = timer.tick() => self.on_timer(Instant::now()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::patterns::PatternConfig;
    use crate::bot::wager::{default_limits, RiskProfile, StakeSequence, WagerConfig};
    use crate::bot::zones::ZoneTable;
    use crate::game::PhaseConfig;
    use serde_json::{json, Value};

    fn engine_with(
        warmup: usize,
        outputs: EngineOutputs,
    ) -> (AdvisorEngine, watch::Receiver<DashboardSnapshot>) {
        engine_with_budget(warmup, outputs, Duration::from_secs(5))
    }

    fn engine_with_budget(
        warmup: usize,
        outputs: EngineOutputs,
        decision_budget: Duration,
    ) -> (AdvisorEngine, watch::Receiver<DashboardSnapshot>) {
        let machine = PhaseStateMachine::new(PhaseConfig {
            presale_threshold_ms: 10_000,
            pairing_timeout: Duration::from_millis(3000),
            early_termination_ticks: 10,
            max_round_ticks: 5000,
        });
        let stats = RollingWindowStatistics::new(&[10, 25, 50, 100], warmup);
        let wager_cfg = WagerConfig {
            initial_bankroll: 1.0,
            base_stake: 0.001,
            payout_odds: 1.0,
            risk_profile: RiskProfile::Moderate,
            limits: default_limits([0.02, 0.05, 0.10]),
        };
        let seq = StakeSequence::new(&[1.0, 1.0, 2.0, 3.0], 0.001, 0).unwrap();
        AdvisorEngine::new(
            EngineConfig {
                decision_window: 100,
                horizon_ticks: 40,
                confidence_sample_target: 50,
                decision_budget,
                stale_after: Duration::from_secs(5),
            },
            machine,
            stats,
            PatternDetector::new(PatternConfig::default()),
            RiskZoneClassifier::new(ZoneTable::standard(1.0).unwrap(), None),
            WagerSequenceEngine::new(wager_cfg, seq),
            outputs,
        )
    }

    fn presale() -> Value {
        json!({"active": false, "rugged": false, "allowPreRoundBuys": true, "cooldownTimer": 5000})
    }

    fn start(id: &str) -> Value {
        json!({"gameId": id, "active": true, "rugged": false, "tickCount": 0, "price": 1.0})
    }

    fn beat(id: &str, tick: u32) -> Value {
        // gentle drift so no pattern fires
        let price = 1.0 + tick as f64 * 0.001;
        json!({"gameId": id, "active": true, "rugged": false, "tickCount": tick, "price": price})
    }

    fn end1(id: &str, tick: u32) -> Value {
        json!({
            "gameId": id, "active": true, "rugged": true, "tickCount": tick, "price": 0.01,
            "gameHistory": [{"id": id, "peakMultiplier": 1.8}]
        })
    }

    fn end2(next: &str, prev: &str) -> Value {
        json!({
            "gameId": next, "active": false, "rugged": true, "cooldownTimer": 15000,
            "gameHistory": [{"id": prev, "peakMultiplier": 1.8}]
        })
    }

    fn feed(e: &mut AdvisorEngine, v: Value) {
        e.on_feed_message(FeedMessage::Snapshot(v), Instant::now());
    }

    fn play_round(e: &mut AdvisorEngine, id: &str, next: &str, duration: u32) {
        feed(e, presale());
        feed(e, start(id));
        for t in 1..duration {
            feed(e, beat(id, t));
        }
        feed(e, end1(id, duration));
        feed(e, end2(next, id));
    }

    #[test]
    fn advice_is_insufficient_data_before_warmup() {
        let (mut e, rx) = engine_with(3, EngineOutputs::default());
        play_round(&mut e, "a", "b", 30);
        feed(&mut e, presale());
        feed(&mut e, start("b"));
        feed(&mut e, beat("b", 1));
        assert_eq!(
            *e.advice(),
            Advice::InsufficientData {
                available: 1,
                required: 3
            }
        );
        assert_eq!(rx.borrow().phase, Phase::Active);
        assert_eq!(e.stats().total_inserted(), 1);
    }

    #[test]
    fn warm_engine_recommends_and_stakes_on_strong_survival() {
        let (mut e, _rx) = engine_with(5, EngineOutputs::default());
        for i in 0..6 {
            play_round(&mut e, &format!("r{}", i), &format!("r{}", i + 1), 400);
        }
        feed(&mut e, presale());
        feed(&mut e, start("r6"));
        for t in 1..=50 {
            feed(&mut e, beat("r6", t));
        }
        // every past round reached tick 400, so survival at 50 + 40 is 1.0
        let rec = e.latest_recommendation.clone().expect("recommendation");
        assert_eq!(rec.round_id, "r6");
        assert_eq!(rec.tick, 50);
        assert!((rec.survival_probability - 1.0).abs() < 1e-12);
        // stake was opened on an earlier tick, so the latest action is a hold
        assert!(e.wager().open.is_some() || e.wager().wins > 0);
        assert_eq!(rec.action, Action::Hold);
        assert!(e.wager().cumulative_risked <= e.wager().bankroll);
    }

    #[test]
    fn unreached_tick_yields_no_evidence() {
        let (mut e, _rx) = engine_with(2, EngineOutputs::default());
        play_round(&mut e, "a", "b", 20);
        play_round(&mut e, "b", "c", 20);
        feed(&mut e, presale());
        feed(&mut e, start("c"));
        for t in 1..=25 {
            feed(&mut e, beat("c", t));
        }
        assert_eq!(*e.advice(), Advice::NoEvidence { tick: 25 });
    }

    #[test]
    fn no_evidence_clears_stale_pattern_flags() {
        let (mut e, rx) = engine_with(2, EngineOutputs::default());
        play_round(&mut e, "a", "b", 10);
        play_round(&mut e, "b", "c", 10);
        feed(&mut e, presale());
        feed(&mut e, start("c"));
        for t in 1..=10 {
            feed(&mut e, beat("c", t));
        }
        assert!(rx.borrow().patterns.early_termination.is_some());
        feed(&mut e, beat("c", 11));
        assert_eq!(*e.advice(), Advice::NoEvidence { tick: 11 });
        let snap = rx.borrow();
        assert_eq!(snap.patterns, PatternFlags::default());
        assert!(snap.zone.is_none());
        assert!(snap.candidates.is_empty());
    }

    #[test]
    fn exit_zone_never_stakes() {
        let (mut e, _rx) = engine_with(5, EngineOutputs::default());
        for i in 0..5 {
            play_round(&mut e, &format!("r{}", i), &format!("r{}", i + 1), 30);
        }
        feed(&mut e, presale());
        feed(&mut e, start("r5"));
        for t in 1..=30 {
            feed(&mut e, beat("r5", t));
            if let Advice::Recommend(rec) = e.advice() {
                assert_ne!(rec.action, Action::Enter);
                assert_eq!(rec.suggested_stake, 0.0);
            }
        }
        // no past round lasted 40 ticks, so survival is zero at every tick
        let rec = e.latest_recommendation.clone().expect("recommendation");
        assert_eq!(rec.zone, crate::bot::zones::ZoneName::Critical);
        assert_eq!(rec.action, Action::Exit);
        assert!(e.wager().open.is_none());
        assert_eq!(e.wager().sequence_level, 0);
    }

    #[test]
    fn volatility_spike_overrides_open_sequence() {
        let (mut e, _rx) = engine_with(5, EngineOutputs::default());
        for i in 0..6 {
            play_round(&mut e, &format!("r{}", i), &format!("r{}", i + 1), 400);
        }
        feed(&mut e, presale());
        feed(&mut e, start("r6"));
        for t in 1..=30 {
            feed(&mut e, beat("r6", t));
        }
        assert!(e.wager().open.is_some());

        // calm drift, then alternating 5% swings
        let swing = |t: u32| {
            let base = 1.0 + 30.0 * 0.001;
            let price = if t % 2 == 1 { base * 1.05 } else { base };
            json!({"gameId": "r6", "active": true, "rugged": false, "tickCount": t, "price": price})
        };
        for t in 31..=38 {
            feed(&mut e, swing(t));
        }
        let rec = e.latest_recommendation.clone().expect("recommendation");
        assert_eq!(rec.tick, 38);
        assert!(rec.patterns.volatility_spike.is_some());
        assert!(rec.zone <= crate::bot::zones::ZoneName::Danger);
        assert_eq!(rec.action, Action::Reduce);
        assert_eq!(rec.suggested_stake, 0.0);

        // same zone with nothing staked is a plain hold
        e.on_command(EngineCommand::ResetWager);
        feed(&mut e, swing(39));
        let rec = e.latest_recommendation.clone().expect("recommendation");
        assert_eq!(rec.tick, 39);
        assert!(rec.patterns.volatility_spike.is_some());
        assert_eq!(rec.action, Action::Hold);
        assert!(e.wager().open.is_none());
    }

    #[test]
    fn decision_over_budget_is_skipped_and_counted() {
        let (mut e, rx) = engine_with_budget(2, EngineOutputs::default(), Duration::ZERO);
        play_round(&mut e, "a", "b", 400);
        play_round(&mut e, "b", "c", 400);
        let before = e.diagnostics().skipped_decisions;
        // decisions are timed from the snapshot's arrival
        let late = |e: &mut AdvisorEngine, v: Value| {
            e.on_feed_message(FeedMessage::Snapshot(v), Instant::now() - Duration::from_millis(5));
        };
        late(&mut e, presale());
        late(&mut e, start("c"));
        for t in 1..=20 {
            late(&mut e, beat("c", t));
        }
        assert!(matches!(e.advice(), Advice::Skipped { .. }));
        assert!(e.diagnostics().skipped_decisions >= before + 20);
        assert!(e.latest_recommendation.is_none());
        assert!(e.wager().open.is_none());
        assert!(rx.borrow().candidates.is_empty());
    }

    #[test]
    fn malformed_snapshots_are_counted_not_fatal() {
        let (mut e, rx) = engine_with(2, EngineOutputs::default());
        feed(&mut e, json!([1, 2, 3]));
        feed(&mut e, json!({"active": true}));
        feed(&mut e, json!({"active": true, "rugged": false, "tickCount": 5, "price": -1.0, "gameId": "x"}));
        assert_eq!(e.diagnostics().malformed, 3);
        assert_eq!(rx.borrow().diagnostics.malformed, 3);
        assert_eq!(e.phase(), Phase::Stale);
    }

    #[test]
    fn disconnect_suppresses_and_discards_live_round() {
        let (mut e, rx) = engine_with(2, EngineOutputs::default());
        feed(&mut e, presale());
        feed(&mut e, start("a"));
        feed(&mut e, beat("a", 1));
        e.on_feed_message(
            FeedMessage::Disconnected {
                source: "t".into(),
                reason: "test".into(),
            },
            Instant::now(),
        );
        assert_eq!(e.phase(), Phase::Stale);
        assert!(matches!(e.advice(), Advice::Suppressed { .. }));
        assert_eq!(rx.borrow().round_id, None);
        assert_eq!(e.diagnostics().discarded_rounds, 1);
        assert_eq!(e.stats().total_inserted(), 0);
    }

    #[test]
    fn feed_silence_goes_stale_on_timer() {
        let (mut e, _rx) = engine_with(2, EngineOutputs::default());
        let t0 = Instant::now();
        e.on_feed_message(FeedMessage::Snapshot(presale()), t0);
        assert_eq!(e.phase(), Phase::Presale);
        e.on_timer(t0 + Duration::from_secs(1));
        assert_eq!(e.phase(), Phase::Presale);
        e.on_timer(t0 + Duration::from_secs(6));
        assert_eq!(e.phase(), Phase::Stale);
    }

    #[test]
    fn committed_rounds_reach_persistence_and_calibration() {
        let (ptx, mut prx) = mpsc::channel(1024);
        let (ctx, mut crx) = mpsc::channel(1024);
        let (mut e, _rx) = engine_with(
            1,
            EngineOutputs {
                persist: Some(ptx),
                calibration: Some(ctx),
            },
        );
        play_round(&mut e, "a", "b", 12);
        match prx.try_recv().unwrap() {
            PersistCommand::Record(r) => {
                assert_eq!(r.round_id, "a");
                assert_eq!(r.duration_ticks, 12);
                assert!(!r.incomplete);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            crx.try_recv().unwrap(),
            CalibrationInput::RoundCommitted(_)
        ));
    }

    #[test]
    fn reset_command_restores_wager_state() {
        let (mut e, _rx) = engine_with(1, EngineOutputs::default());
        for i in 0..2 {
            play_round(&mut e, &format!("r{}", i), &format!("r{}", i + 1), 400);
        }
        feed(&mut e, presale());
        feed(&mut e, start("r2"));
        for t in 1..=5 {
            feed(&mut e, beat("r2", t));
        }
        e.on_command(EngineCommand::ResetWager);
        assert!(e.wager().open.is_none());
        assert_eq!(e.wager().sequence_level, 0);
        assert!((e.wager().bankroll - 1.0).abs() < 1e-12);
    }
}

//! Round phase detection.
//!
//! The feed never states which phase the game is in; it is inferred from the
//! normalized event stream. The machine cycles
//! `Presale → Active → Terminating → Cooldown → Presale`, with `Stale` as a
//! super-state entered on disconnect or an unrecoverable ordering anomaly.
//! Every transition is taken one step at a time so no state is ever skipped.

use chrono::Utc;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::event::NormalizedEvent;
use super::round::{GameRecordAccumulator, InProgressRound, PendingEnd, TickUpdate};
use crate::db::models::GameRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Not synchronized with the feed
    Stale,
    Presale,
    Active,
    /// Event 1 seen, waiting for event 2
    Terminating,
    Cooldown,
}

impl Phase {
    /// Successor in the round cycle. `Stale` has none.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Stale => None,
            Phase::Presale => Some(Phase::Active),
            Phase::Active => Some(Phase::Terminating),
            Phase::Terminating => Some(Phase::Cooldown),
            Phase::Cooldown => Some(Phase::Presale),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Stale => "stale",
            Phase::Presale => "presale",
            Phase::Active => "active",
            Phase::Terminating => "terminating",
            Phase::Cooldown => "cooldown",
        }
    }
}

/// Output of the machine for one input.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseEvent {
    PhaseChanged { from: Phase, to: Phase },
    PresaleOpened,
    PresaleClosed,
    RoundStarted { round_id: String },
    TickAdvanced { tick: u32 },
    TerminationObserved { round_id: String, final_tick: u32 },
    RoundEnded(GameRecord),
    RoundDiscarded { round_id: String, reason: &'static str },
    WentStale { reason: &'static str },
}

#[derive(Debug, Clone)]
pub struct PhaseConfig {
    pub presale_threshold_ms: u64,
    pub pairing_timeout: Duration,
    pub early_termination_ticks: u32,
    pub max_round_ticks: u32,
}

/// Counters for inputs the machine refused or repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MachineCounters {
    pub duplicates: u64,
    pub ordering_anomalies: u64,
    pub degraded_commits: u64,
    pub discarded_rounds: u64,
}

pub struct PhaseStateMachine {
    phase: Phase,
    round: InProgressRound,
    pending: Option<PendingEnd>,
    accumulator: GameRecordAccumulator,
    config: PhaseConfig,
    cooldown_ms: u64,
    last_committed: Option<String>,
    counters: MachineCounters,
}

impl PhaseStateMachine {
    pub fn new(config: PhaseConfig) -> Self {
        PhaseStateMachine {
            phase: Phase::Stale,
            round: InProgressRound::new(config.max_round_ticks),
            pending: None,
            accumulator: GameRecordAccumulator::new(config.early_termination_ticks),
            config,
            cooldown_ms: 0,
            last_committed: None,
            counters: MachineCounters::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn round(&self) -> &InProgressRound {
        &self.round
    }

    #[cfg(test)]
    pub fn pending(&self) -> Option<&PendingEnd> {
        self.pending.as_ref()
    }

    pub fn cooldown_ms(&self) -> u64 {
        self.cooldown_ms
    }

    pub fn counters(&self) -> MachineCounters {
        self.counters
    }

    /// Feed one normalized event. `now` drives the pairing timeout.
    pub fn handle(&mut self, event: NormalizedEvent, now: Instant) -> Vec<PhaseEvent> {
        let mut out = Vec::new();
        self.expire_pending(now, &mut out);
        if self.phase == Phase::Stale {
            self.on_stale(event, &mut out);
        } else {
            self.on_synced(event, now, &mut out);
        }
        out
    }

    /// Commit a pending round whose event 2 is overdue.
    pub fn poll_timeout(&mut self, now: Instant) -> Vec<PhaseEvent> {
        let mut out = Vec::new();
        self.expire_pending(now, &mut out);
        out
    }

    /// Upstream disconnected or went silent. Pending event-1 data is committed
    /// degraded; a live round is discarded.
    pub fn mark_stale(&mut self, reason: &'static str) -> Vec<PhaseEvent> {
        let mut out = Vec::new();
        if self.phase == Phase::Stale {
            return out;
        }
        if self.phase == Phase::Active {
            self.discard_round("feed went stale", &mut out);
        }
        self.go_stale(reason, &mut out);
        out
    }

    fn on_stale(&mut self, event: NormalizedEvent, out: &mut Vec<PhaseEvent>) {
        match event {
            NormalizedEvent::PresaleWindow {
                allow_buys,
                cooldown_ms,
            } => {
                self.cooldown_ms = cooldown_ms;
                if self.presale_open(allow_buys, cooldown_ms) {
                    self.enter(Phase::Presale, out);
                } else {
                    self.enter(Phase::Cooldown, out);
                }
            }
            NormalizedEvent::RoundEndSecondary { cooldown_ms, .. } => {
                self.cooldown_ms = cooldown_ms;
                self.enter(Phase::Cooldown, out);
            }
            NormalizedEvent::RoundStart { round_id, price } => {
                self.start_round(&round_id, price, out);
            }
            other => {
                debug!("Ignoring {} while stale", other.kind());
            }
        }
    }

    fn on_synced(&mut self, event: NormalizedEvent, now: Instant, out: &mut Vec<PhaseEvent>) {
        match event {
            NormalizedEvent::Heartbeat {
                round_id,
                tick,
                price,
                stake_volume,
                ..
            } => self.on_heartbeat(&round_id, tick, price, stake_volume, out),
            NormalizedEvent::RoundStart { round_id, price } => {
                self.on_round_start(round_id, price, out)
            }
            NormalizedEvent::RoundEndPrimary {
                round_id,
                final_tick,
                final_price,
                reported_peak,
                revealed_seed,
            } => self.on_primary_end(
                PendingEnd {
                    round_id,
                    final_tick,
                    final_price,
                    reported_peak,
                    revealed_seed,
                    observed_at: now,
                },
                out,
            ),
            NormalizedEvent::RoundEndSecondary {
                next_round_id,
                terminated_round_id,
                cooldown_ms,
            } => self.on_secondary_end(next_round_id, terminated_round_id, cooldown_ms, out),
            NormalizedEvent::PresaleWindow {
                allow_buys,
                cooldown_ms,
            } => self.on_presale_window(allow_buys, cooldown_ms, out),
        }
    }

    fn on_heartbeat(
        &mut self,
        round_id: &str,
        tick: u32,
        price: f64,
        volume: f64,
        out: &mut Vec<PhaseEvent>,
    ) {
        match self.phase {
            Phase::Active if round_id == self.round.round_id() => {
                match self.round.record(tick, price, volume) {
                    TickUpdate::Accepted => out.push(PhaseEvent::TickAdvanced { tick }),
                    TickUpdate::Duplicate | TickUpdate::OutOfOrder => {
                        self.counters.duplicates += 1;
                        debug!(
                            "Ignoring heartbeat tick {} (current {})",
                            tick,
                            self.round.current_tick()
                        );
                    }
                }
            }
            Phase::Active => {
                self.anomaly("heartbeat for a different round while active");
            }
            Phase::Terminating if round_id == self.round.round_id() => {
                self.counters.duplicates += 1;
            }
            Phase::Presale | Phase::Cooldown if self.last_committed.as_deref() == Some(round_id) => {
                self.counters.duplicates += 1;
            }
            _ => {
                // A round is running that we never saw start.
                self.anomaly("heartbeat without a round start");
                self.go_stale("missed round start", out);
            }
        }
    }

    fn on_round_start(&mut self, round_id: String, price: f64, out: &mut Vec<PhaseEvent>) {
        match self.phase {
            Phase::Active if round_id == self.round.round_id() => {
                self.counters.duplicates += 1;
            }
            Phase::Active => {
                self.anomaly("round start while another round is active");
                self.discard_round("missed end of round", out);
                self.go_stale("missed end of round", out);
                self.start_round(&round_id, price, out);
            }
            Phase::Terminating
                if self.pending.as_ref().map(|p| p.round_id.as_str()) == Some(round_id.as_str()) =>
            {
                self.counters.duplicates += 1;
            }
            _ if self.last_committed.as_deref() == Some(round_id.as_str()) => {
                debug!("Ignoring late start of committed round {}", round_id);
                self.counters.duplicates += 1;
            }
            _ => {
                self.advance_to(Phase::Presale, out);
                self.start_round(&round_id, price, out);
            }
        }
    }

    fn on_primary_end(&mut self, end: PendingEnd, out: &mut Vec<PhaseEvent>) {
        match self.phase {
            Phase::Active if end.round_id == self.round.round_id() => {
                info!(
                    "Round {} terminated at tick {} (awaiting confirmation)",
                    end.round_id, end.final_tick
                );
                out.push(PhaseEvent::TerminationObserved {
                    round_id: end.round_id.clone(),
                    final_tick: end.final_tick,
                });
                self.pending = Some(end);
                self.enter(Phase::Terminating, out);
            }
            Phase::Active => {
                warn!(
                    "Ordering anomaly: end of round {} while tracking {}",
                    end.round_id,
                    self.round.round_id()
                );
                self.counters.ordering_anomalies += 1;
                self.discard_round("end event for a different round", out);
                self.go_stale("end event for a different round", out);
            }
            Phase::Terminating
                if self.pending.as_ref().map(|p| p.round_id.as_str()) == Some(&end.round_id) =>
            {
                self.counters.duplicates += 1;
            }
            _ if self.last_committed.as_deref() == Some(end.round_id.as_str()) => {
                self.counters.duplicates += 1;
            }
            _ => self.anomaly("end of round outside an active round"),
        }
    }

    fn on_secondary_end(
        &mut self,
        next_round_id: String,
        terminated_round_id: Option<String>,
        cooldown_ms: u64,
        out: &mut Vec<PhaseEvent>,
    ) {
        match self.phase {
            Phase::Terminating => {
                self.cooldown_ms = cooldown_ms;
                let pending_id = self
                    .pending
                    .as_ref()
                    .map(|p| p.round_id.clone())
                    .unwrap_or_default();
                match terminated_round_id {
                    Some(terminated) if terminated != pending_id => {
                        warn!(
                            "Ordering anomaly: end pair mismatch (event 1 for {}, event 2 for {}); nothing committed",
                            pending_id, terminated
                        );
                        self.counters.ordering_anomalies += 1;
                        self.pending = None;
                        self.counters.discarded_rounds += 1;
                        out.push(PhaseEvent::RoundDiscarded {
                            round_id: pending_id,
                            reason: "mismatched end pair",
                        });
                        self.enter(Phase::Cooldown, out);
                    }
                    _ => {
                        debug!("End pair confirmed; next round {}", next_round_id);
                        self.commit(false, out);
                        self.enter(Phase::Cooldown, out);
                    }
                }
            }
            Phase::Active => {
                warn!(
                    "Ordering anomaly: event 2 without event 1 for round {}",
                    self.round.round_id()
                );
                self.counters.ordering_anomalies += 1;
                self.discard_round("event 2 without event 1", out);
                self.go_stale("event 2 without event 1", out);
                self.on_stale(
                    NormalizedEvent::RoundEndSecondary {
                        next_round_id,
                        terminated_round_id,
                        cooldown_ms,
                    },
                    out,
                );
            }
            _ => {
                self.counters.duplicates += 1;
            }
        }
    }

    fn on_presale_window(&mut self, allow_buys: bool, cooldown_ms: u64, out: &mut Vec<PhaseEvent>) {
        match self.phase {
            Phase::Active => {
                warn!(
                    "Ordering anomaly: presale while round {} is active",
                    self.round.round_id()
                );
                self.counters.ordering_anomalies += 1;
                self.discard_round("both end events missed", out);
                self.go_stale("both end events missed", out);
                self.on_stale(
                    NormalizedEvent::PresaleWindow {
                        allow_buys,
                        cooldown_ms,
                    },
                    out,
                );
                return;
            }
            Phase::Terminating => {
                self.advance_to(Phase::Cooldown, out);
            }
            _ => {}
        }
        self.cooldown_ms = cooldown_ms;
        if self.phase == Phase::Cooldown && self.presale_open(allow_buys, cooldown_ms) {
            self.enter(Phase::Presale, out);
        }
    }

    fn presale_open(&self, allow_buys: bool, cooldown_ms: u64) -> bool {
        allow_buys && cooldown_ms <= self.config.presale_threshold_ms
    }

    fn expire_pending(&mut self, now: Instant, out: &mut Vec<PhaseEvent>) {
        let overdue = self.phase == Phase::Terminating
            && self.pending.as_ref().is_some_and(|p| {
                now.saturating_duration_since(p.observed_at) >= self.config.pairing_timeout
            });
        if overdue {
            warn!(
                "Event 2 not received within {:?}; committing degraded record",
                self.config.pairing_timeout
            );
            self.advance_to(Phase::Cooldown, out);
        }
    }

    fn start_round(&mut self, round_id: &str, price: f64, out: &mut Vec<PhaseEvent>) {
        self.round.reset(round_id, price, Utc::now());
        self.enter(Phase::Active, out);
        info!("Round {} started", round_id);
        out.push(PhaseEvent::RoundStarted {
            round_id: round_id.to_string(),
        });
    }

    /// Walk the cycle up to `target`. Crossing `Terminating` commits the
    /// pending round degraded. Never walks into or through `Active`.
    fn advance_to(&mut self, target: Phase, out: &mut Vec<PhaseEvent>) {
        while self.phase != target {
            let Some(next) = self.phase.next() else {
                return;
            };
            if next == Phase::Active {
                return;
            }
            if self.phase == Phase::Terminating {
                if self.pending.is_some() {
                    self.commit(true, out);
                } else {
                    self.counters.discarded_rounds += 1;
                }
            }
            self.enter(next, out);
        }
    }

    fn enter(&mut self, to: Phase, out: &mut Vec<PhaseEvent>) {
        let from = self.phase;
        if from == to {
            return;
        }
        self.phase = to;
        debug!("Phase {} -> {}", from.as_str(), to.as_str());
        out.push(PhaseEvent::PhaseChanged { from, to });
        if from == Phase::Presale {
            out.push(PhaseEvent::PresaleClosed);
        }
        if to == Phase::Presale {
            out.push(PhaseEvent::PresaleOpened);
        }
    }

    fn commit(&mut self, incomplete: bool, out: &mut Vec<PhaseEvent>) {
        let Some(end) = self.pending.take() else {
            return;
        };
        let now = Utc::now();
        let record = self.accumulator.build(&self.round, &end, incomplete, now);
        if self.round.truncated() {
            warn!(
                "Round {} outgrew the tick buffer; pattern history is partial",
                record.round_id
            );
        }
        debug!(
            round = %record.round_id,
            wall_ms = (now - self.round.started_at()).num_milliseconds(),
            "Round wall time"
        );
        if incomplete {
            self.counters.degraded_commits += 1;
            warn!(
                "Round {} committed without confirmation (incomplete)",
                record.round_id
            );
        } else {
            info!(
                "Round {} committed: {} ticks, peak {:.3}x{}",
                record.round_id,
                record.duration_ticks,
                record.peak_value,
                if record.is_early_termination { " (early)" } else { "" }
            );
        }
        self.last_committed = Some(record.round_id.clone());
        out.push(PhaseEvent::RoundEnded(record));
    }

    fn discard_round(&mut self, reason: &'static str, out: &mut Vec<PhaseEvent>) {
        if !self.round.is_tracking() {
            return;
        }
        self.counters.discarded_rounds += 1;
        warn!("Discarding round {}: {}", self.round.round_id(), reason);
        out.push(PhaseEvent::RoundDiscarded {
            round_id: self.round.round_id().to_string(),
            reason,
        });
        self.round.clear();
    }

    /// Pending event-1 data is committed degraded before the round is dropped.
    fn go_stale(&mut self, reason: &'static str, out: &mut Vec<PhaseEvent>) {
        if self.pending.is_some() {
            self.commit(true, out);
        }
        self.round.clear();
        if self.phase != Phase::Stale {
            warn!("Phase machine stale: {}", reason);
            self.enter(Phase::Stale, out);
            out.push(PhaseEvent::WentStale { reason });
        }
    }

    fn anomaly(&mut self, what: &str) {
        self.counters.ordering_anomalies += 1;
        warn!("Ordering anomaly: {}", what);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> PhaseConfig {
        PhaseConfig {
            presale_threshold_ms: 10_000,
            pairing_timeout: Duration::from_millis(3000),
            early_termination_ticks: 10,
            max_round_ticks: 5000,
        }
    }

    fn presale(cooldown_ms: u64) -> NormalizedEvent {
        NormalizedEvent::PresaleWindow {
            allow_buys: true,
            cooldown_ms,
        }
    }

    fn start(id: &str) -> NormalizedEvent {
        NormalizedEvent::RoundStart {
            round_id: id.into(),
            price: 1.0,
        }
    }

    fn beat(id: &str, tick: u32) -> NormalizedEvent {
        NormalizedEvent::Heartbeat {
            round_id: id.into(),
            tick,
            price: 1.0 + tick as f64 * 0.01,
            trade_count: 0,
            stake_volume: 0.1,
        }
    }

    fn primary(id: &str, tick: u32) -> NormalizedEvent {
        NormalizedEvent::RoundEndPrimary {
            round_id: id.into(),
            final_tick: tick,
            final_price: 0.01,
            reported_peak: None,
            revealed_seed: None,
        }
    }

    fn secondary(next: &str, terminated: &str) -> NormalizedEvent {
        NormalizedEvent::RoundEndSecondary {
            next_round_id: next.into(),
            terminated_round_id: Some(terminated.into()),
            cooldown_ms: 15_000,
        }
    }

    fn feed(m: &mut PhaseStateMachine, events: Vec<NormalizedEvent>) -> Vec<PhaseEvent> {
        let now = Instant::now();
        events.into_iter().flat_map(|e| m.handle(e, now)).collect()
    }

    fn records(events: &[PhaseEvent]) -> Vec<GameRecord> {
        events
            .iter()
            .filter_map(|e| match e {
                PhaseEvent::RoundEnded(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    fn full_round(id: &str, next: &str, ticks: u32) -> Vec<NormalizedEvent> {
        let mut evs = vec![start(id)];
        evs.extend((1..=ticks).map(|t| beat(id, t)));
        evs.push(primary(id, ticks));
        evs.push(secondary(next, id));
        evs.push(NormalizedEvent::PresaleWindow {
            allow_buys: false,
            cooldown_ms: 14_000,
        });
        evs.push(presale(9_000));
        evs
    }

    #[test]
    fn phases_only_advance_in_cycle_order() {
        let mut m = PhaseStateMachine::new(cfg());
        let mut events = vec![presale(8000)];
        events.extend(full_round("a", "b", 30));
        events.extend(full_round("b", "c", 120));
        // skip the explicit presale window before this round
        events.push(secondary("d", "zz"));
        events.extend(full_round("c", "d", 5));
        let out = feed(&mut m, events);

        let changes: Vec<(Phase, Phase)> = out
            .iter()
            .filter_map(|e| match e {
                PhaseEvent::PhaseChanged { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect();
        assert!(changes.len() >= 9);
        assert_eq!(changes[0], (Phase::Stale, Phase::Presale));
        for (from, to) in &changes[1..] {
            assert_eq!(from.next(), Some(*to), "illegal transition {:?} -> {:?}", from, to);
        }
        assert_eq!(records(&out).len(), 3);
    }

    #[test]
    fn complete_pair_commits_one_record() {
        let mut m = PhaseStateMachine::new(cfg());
        let mut events = vec![presale(5000)];
        events.extend(full_round("a", "b", 42));
        let out = feed(&mut m, events);
        let recs = records(&out);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].round_id, "a");
        assert_eq!(recs[0].duration_ticks, 42);
        assert!(!recs[0].incomplete);
        assert!(!recs[0].is_early_termination);
        assert_eq!(m.phase(), Phase::Presale);
    }

    #[test]
    fn round_ending_at_tick_six_is_early() {
        let mut m = PhaseStateMachine::new(cfg());
        let mut events = vec![presale(5000)];
        events.extend(full_round("a", "b", 6));
        let recs = records(&feed(&mut m, events));
        assert_eq!(recs.len(), 1);
        assert!(recs[0].is_early_termination);
        assert_eq!(recs[0].duration_ticks, 6);
    }

    #[test]
    fn missing_event_two_commits_one_degraded_record_after_timeout() {
        let mut m = PhaseStateMachine::new(cfg());
        let t0 = Instant::now();
        let mut out = Vec::new();
        for e in [presale(5000), start("a"), beat("a", 1), beat("a", 2), primary("a", 2)] {
            out.extend(m.handle(e, t0));
        }
        assert_eq!(m.phase(), Phase::Terminating);
        assert!(records(&out).is_empty());

        // not yet overdue
        assert!(m.poll_timeout(t0).is_empty());
        let later = m.pending().unwrap().observed_at + Duration::from_millis(3001);
        let fired = m.poll_timeout(later);
        let recs = records(&fired);
        assert_eq!(recs.len(), 1);
        assert!(recs[0].incomplete);
        assert_eq!(recs[0].round_id, "a");
        assert_eq!(m.phase(), Phase::Cooldown);
        assert_eq!(m.counters().degraded_commits, 1);

        // a late event 2 does not commit again
        let late = m.handle(secondary("b", "a"), later);
        assert!(records(&late).is_empty());
        assert!(records(&m.poll_timeout(later + Duration::from_secs(60))).is_empty());
    }

    #[test]
    fn mismatched_pair_commits_nothing() {
        let mut m = PhaseStateMachine::new(cfg());
        let out = feed(
            &mut m,
            vec![presale(5000), start("a"), beat("a", 1), primary("a", 1), secondary("c", "b")],
        );
        assert!(records(&out).is_empty());
        assert_eq!(m.counters().ordering_anomalies, 1);
        assert_eq!(m.phase(), Phase::Cooldown);
        assert!(out.iter().any(|e| matches!(
            e,
            PhaseEvent::RoundDiscarded { reason: "mismatched end pair", .. }
        )));
    }

    #[test]
    fn event_one_for_wrong_round_goes_stale() {
        let mut m = PhaseStateMachine::new(cfg());
        let out = feed(
            &mut m,
            vec![presale(5000), start("a"), beat("a", 1), primary("x", 9), secondary("y", "x")],
        );
        assert!(records(&out).is_empty());
        assert_eq!(m.phase(), Phase::Cooldown);
        assert!(m.counters().ordering_anomalies >= 1);
    }

    #[test]
    fn replayed_heartbeat_leaves_round_unchanged() {
        let mut m = PhaseStateMachine::new(cfg());
        feed(&mut m, vec![presale(5000), start("a"), beat("a", 1), beat("a", 2)]);
        let before = m.round().clone();
        let out = feed(&mut m, vec![beat("a", 2), beat("a", 1)]);
        assert!(out.is_empty());
        assert_eq!(m.round(), &before);
        assert_eq!(m.counters().duplicates, 2);
    }

    #[test]
    fn late_start_of_committed_round_is_a_duplicate() {
        let mut m = PhaseStateMachine::new(cfg());
        feed(
            &mut m,
            vec![presale(5000), start("a"), beat("a", 1), primary("a", 1)],
        );
        assert!(feed(&mut m, vec![start("a")]).is_empty());
        assert_eq!(m.phase(), Phase::Terminating);

        feed(&mut m, vec![secondary("b", "a")]);
        assert_eq!(m.phase(), Phase::Cooldown);
        let out = feed(&mut m, vec![start("a")]);
        assert!(out.is_empty());
        assert_eq!(m.phase(), Phase::Cooldown);
        assert_eq!(m.counters().duplicates, 2);

        let out = feed(&mut m, vec![start("b")]);
        assert!(out.contains(&PhaseEvent::RoundStarted { round_id: "b".into() }));
        assert_eq!(m.phase(), Phase::Active);
        assert_eq!(m.counters().ordering_anomalies, 0);
        assert_eq!(m.counters().discarded_rounds, 0);
    }

    #[test]
    fn stale_ignores_partial_rounds_until_clean_entry() {
        let mut m = PhaseStateMachine::new(cfg());
        let out = feed(&mut m, vec![beat("a", 50), beat("a", 51), primary("a", 51)]);
        assert!(out.is_empty());
        assert_eq!(m.phase(), Phase::Stale);
        feed(&mut m, vec![secondary("b", "a")]);
        assert_eq!(m.phase(), Phase::Cooldown);
    }

    #[test]
    fn disconnect_discards_live_round_and_commits_pending() {
        let mut m = PhaseStateMachine::new(cfg());
        feed(&mut m, vec![presale(5000), start("a"), beat("a", 1)]);
        let out = m.mark_stale("disconnected");
        assert_eq!(m.phase(), Phase::Stale);
        assert!(records(&out).is_empty());
        assert!(!m.round().is_tracking());

        feed(&mut m, vec![start("b"), beat("b", 1), primary("b", 1)]);
        let out = m.mark_stale("disconnected");
        let recs = records(&out);
        assert_eq!(recs.len(), 1);
        assert!(recs[0].incomplete);
    }

    #[test]
    fn round_start_during_cooldown_passes_through_presale() {
        let mut m = PhaseStateMachine::new(cfg());
        let out = feed(
            &mut m,
            vec![presale(5000), start("a"), primary("a", 0), secondary("b", "a"), start("b")],
        );
        assert!(out.contains(&PhaseEvent::PhaseChanged {
            from: Phase::Cooldown,
            to: Phase::Presale
        }));
        assert_eq!(m.phase(), Phase::Active);
        assert_eq!(m.round().round_id(), "b");
    }

    #[test]
    fn presale_while_active_discards_round() {
        let mut m = PhaseStateMachine::new(cfg());
        let out = feed(&mut m, vec![presale(5000), start("a"), beat("a", 1), presale(4000)]);
        assert!(records(&out).is_empty());
        assert_eq!(m.phase(), Phase::Presale);
        assert_eq!(m.counters().discarded_rounds, 1);
    }
}

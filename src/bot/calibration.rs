//! Recommendation → outcome pairing and offline accuracy reporting.
//!
//! Runs as its own task. The decision loop only ever `try_send`s into it, so
//! nothing here can feed back into live decisions.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::db::models::{Action, GameRecord, Outcome, Recommendation};
use crate::db::PersistCommand;

/// Probability calibration (Platt scaling):
/// `p_calibrated = sigmoid(a * logit(p_raw) + b)`.
const EPS: f64 = 1e-6;

/// Most recent pairs used for the Platt fit.
const FIT_SAMPLE_LIMIT: usize = 5_000;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PlattCalibration {
    pub a: f64,
    pub b: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FitMetrics {
    pub logloss_before: f64,
    pub logloss_after: f64,
    pub brier_before: f64,
    pub brier_after: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FitResult {
    pub calibration: PlattCalibration,
    pub metrics: FitMetrics,
}

fn clamp_prob(p: f64) -> f64 {
    p.clamp(EPS, 1.0 - EPS)
}

fn logit(p: f64) -> f64 {
    let p = clamp_prob(p);
    (p / (1.0 - p)).ln()
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

fn logloss(p: f64, y: f64) -> f64 {
    let p = clamp_prob(p);
    -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
}

pub fn apply_platt(raw_prob: f64, model: PlattCalibration) -> f64 {
    sigmoid(model.a * logit(raw_prob) + model.b).clamp(0.0, 1.0)
}

/// Gradient-descent fit over `(raw_probability, label)` pairs. `None` when
/// there are too few samples or only one class.
pub fn fit_platt(
    samples: &[(f64, f64)],
    max_iters: usize,
    learning_rate: f64,
    l2: f64,
) -> Option<FitResult> {
    if samples.len() < 8 {
        return None;
    }
    let positives = samples.iter().filter(|(_, y)| *y > 0.5).count();
    if positives == 0 || positives == samples.len() {
        return None;
    }

    let n = samples.len() as f64;
    let (mut a, mut b) = (1.0f64, 0.0f64);
    for i in 0..max_iters.max(1) {
        let lr = learning_rate / (1.0 + 0.01 * i as f64);
        let (mut grad_a, mut grad_b) = (0.0, 0.0);
        for (raw_p, y) in samples {
            let x = logit(*raw_p);
            let err = sigmoid(a * x + b) - *y;
            grad_a += err * x;
            grad_b += err;
        }
        a -= lr * (grad_a / n + l2 * a);
        b -= lr * (grad_b / n);
        if !a.is_finite() || !b.is_finite() {
            return None;
        }
    }

    let model = PlattCalibration { a, b };
    let mut m = FitMetrics {
        logloss_before: 0.0,
        logloss_after: 0.0,
        brier_before: 0.0,
        brier_after: 0.0,
    };
    for (raw_p, y) in samples {
        let before = clamp_prob(*raw_p);
        let after = apply_platt(*raw_p, model);
        m.logloss_before += logloss(before, *y);
        m.logloss_after += logloss(after, *y);
        m.brier_before += (before - *y).powi(2);
        m.brier_after += (after - *y).powi(2);
    }
    m.logloss_before /= n;
    m.logloss_after /= n;
    m.brier_before /= n;
    m.brier_after /= n;
    Some(FitResult {
        calibration: model,
        metrics: m,
    })
}

// ── Tracker ──────────────────────────────────────────────────────────────────

/// Input to the tracker task.
#[derive(Debug, Clone)]
pub enum CalibrationInput {
    Recommendation(Recommendation),
    RoundCommitted(GameRecord),
    /// Round ended without a record; its recommendations can never resolve.
    RoundDiscarded(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct AccuracyBucket {
    pub action: Action,
    pub horizon: u32,
    pub samples: usize,
    pub terminated_within: usize,
    pub rate: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CalibrationReport {
    pub resolved: usize,
    pub pending: usize,
    pub from_incomplete_records: usize,
    pub buckets: Vec<AccuracyBucket>,
    /// Of survival probabilities against whether the round survived the
    /// recommendation's own horizon
    pub brier_score: Option<f64>,
    pub platt: Option<FitResult>,
}

#[derive(Debug)]
pub struct OutcomeCalibrationTracker {
    horizons: Vec<u32>,
    pending: HashMap<String, Vec<Recommendation>>,
    /// Arrival order of pending rounds, for pruning
    pending_order: VecDeque<String>,
    max_pending_rounds: usize,
    log: VecDeque<(Recommendation, Outcome)>,
    max_log: usize,
}

impl OutcomeCalibrationTracker {
    pub fn new(horizons: Vec<u32>, max_log: usize) -> Self {
        OutcomeCalibrationTracker {
            horizons,
            pending: HashMap::new(),
            pending_order: VecDeque::new(),
            max_pending_rounds: 16,
            log: VecDeque::new(),
            max_log: max_log.max(1),
        }
    }

    pub fn record_recommendation(&mut self, rec: Recommendation) {
        if !self.pending.contains_key(&rec.round_id) {
            self.pending_order.push_back(rec.round_id.clone());
            while self.pending_order.len() > self.max_pending_rounds {
                if let Some(old) = self.pending_order.pop_front() {
                    if let Some(dropped) = self.pending.remove(&old) {
                        warn!(round = %old, dropped = dropped.len(), "Dropping unresolved recommendations");
                    }
                }
            }
        }
        self.pending.entry(rec.round_id.clone()).or_default().push(rec);
    }

    /// Pair every pending recommendation for this round with its outcome.
    pub fn resolve_round(&mut self, record: &GameRecord) -> Vec<Outcome> {
        let Some(recs) = self.pending.remove(&record.round_id) else {
            return Vec::new();
        };
        self.pending_order.retain(|r| r != &record.round_id);
        let mut out = Vec::with_capacity(recs.len());
        for rec in recs {
            let outcome = Outcome::resolve(&rec, record, &self.horizons);
            out.push(outcome.clone());
            self.log.push_back((rec, outcome));
            if self.log.len() > self.max_log {
                self.log.pop_front();
            }
        }
        out
    }

    pub fn discard_round(&mut self, round_id: &str) {
        if self.pending.remove(round_id).is_some() {
            self.pending_order.retain(|r| r != round_id);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Full report including the Platt fit.
    pub fn report(&self) -> CalibrationReport {
        let (mut report, fit_samples) = self.summary();
        report.platt = fit_calibration(&fit_samples);
        report
    }

    /// Report without the Platt fit, plus the pairs the fit would use.
    pub fn summary(&self) -> (CalibrationReport, Vec<(f64, f64)>) {
        let mut counts: BTreeMap<(Action, u32), (usize, usize)> = BTreeMap::new();
        let mut brier_sum = 0.0;
        let mut degraded = 0;
        for (rec, out) in &self.log {
            for (h, within) in &out.within_horizon {
                let e = counts.entry((rec.action, *h)).or_insert((0, 0));
                e.0 += 1;
                if *within {
                    e.1 += 1;
                }
            }
            brier_sum += (rec.survival_probability - survived(rec, out)).powi(2);
            if out.from_incomplete_record {
                degraded += 1;
            }
        }
        let buckets = counts
            .into_iter()
            .map(|((action, horizon), (samples, terminated_within))| AccuracyBucket {
                action,
                horizon,
                samples,
                terminated_within,
                rate: terminated_within as f64 / samples as f64,
            })
            .collect();

        let fit_samples: Vec<(f64, f64)> = self
            .log
            .iter()
            .rev()
            .take(FIT_SAMPLE_LIMIT)
            .map(|(rec, out)| (rec.survival_probability, survived(rec, out)))
            .collect();

        let report = CalibrationReport {
            resolved: self.log.len(),
            pending: self.pending_count(),
            from_incomplete_records: degraded,
            buckets,
            brier_score: (!self.log.is_empty()).then(|| brier_sum / self.log.len() as f64),
            platt: None,
        };
        (report, fit_samples)
    }
}

fn fit_calibration(samples: &[(f64, f64)]) -> Option<FitResult> {
    fit_platt(samples, 300, 0.2, 1e-3)
}

fn survived(rec: &Recommendation, out: &Outcome) -> f64 {
    if out.ticks_to_termination >= rec.horizon_ticks {
        1.0
    } else {
        0.0
    }
}

/// Tracker task: pairs recommendations with outcomes, forwards outcomes to
/// persistence and republishes the report after each resolved round.
pub async fn run_tracker(
    mut tracker: OutcomeCalibrationTracker,
    mut rx: mpsc::Receiver<CalibrationInput>,
    report_tx: watch::Sender<CalibrationReport>,
    persist_tx: Option<mpsc::Sender<PersistCommand>>,
) {
    info!("Calibration tracker started");
    while let Some(input) = rx.recv().await {
        match input {
            CalibrationInput::Recommendation(rec) => tracker.record_recommendation(rec),
            CalibrationInput::RoundCommitted(record) => {
                let outcomes = tracker.resolve_round(&record);
                if outcomes.is_empty() {
                    continue;
                }
                debug!(round = %record.round_id, n = outcomes.len(), "Resolved outcomes");
                if let Some(tx) = &persist_tx {
                    for o in outcomes {
                        if tx.try_send(PersistCommand::Outcome(o)).is_err() {
                            warn!("Persistence queue full; outcome dropped");
                        }
                    }
                }
                // the fit is CPU-bound; keep it off the async workers
                let (mut report, samples) = tracker.summary();
                match tokio::task::spawn_blocking(move || fit_calibration(&samples)).await {
                    Ok(fit) => report.platt = fit,
                    Err(e) => warn!("Platt fit failed: {}", e),
                }
                let _ = report_tx.send(report);
            }
            CalibrationInput::RoundDiscarded(round_id) => tracker.discard_round(&round_id),
        }
    }
    info!("Calibration tracker stopped");
}

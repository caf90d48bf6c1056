use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

mod bot;
mod config;
mod dashboard;
mod db;
mod feed;
mod game;
mod stats;

use bot::backtest::run_backtest;
use bot::calibration::{run_tracker, CalibrationReport, OutcomeCalibrationTracker};
use bot::patterns::PatternDetector;
use bot::wager::WagerSequenceEngine;
use bot::zones::RiskZoneClassifier;
use bot::{AdvisorEngine, EngineOutputs};
use config::Config;
use dashboard::AppState;
use db::{run_persistence, Database};
use feed::replay::ReplaySource;
use feed::websocket::{WebSocketSource, WebSocketSourceConfig};
use feed::SnapshotSource;
use game::PhaseStateMachine;
use stats::RollingWindowStatistics;

const FEED_QUEUE: usize = 1024;
const PERSIST_QUEUE: usize = 512;
const CALIBRATION_QUEUE: usize = 512;
const COMMAND_QUEUE: usize = 16;
const CALIBRATION_LOG: usize = 20_000;
const TIMER_PERIOD: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    if config.backtest {
        return backtest(&config);
    }

    // Open database; the core keeps running without it
    let db = if config.no_persist {
        info!("Persistence disabled");
        None
    } else {
        match Database::open(&config.database_path) {
            Ok(db) => {
                info!("Database opened: {}", config.database_path);
                Some(db)
            }
            Err(e) => {
                warn!(
                    "Could not open {} ({}); continuing without persistence",
                    config.database_path, e
                );
                None
            }
        }
    };

    let history = match &db {
        Some(db) if config.history_preload > 0 => {
            match db.recent_game_records(config.history_preload as i64) {
                Ok(recs) => recs,
                Err(e) => {
                    warn!("History preload failed: {}", e);
                    Vec::new()
                }
            }
        }
        _ => Vec::new(),
    };
    if let Some(db) = &db {
        if let (Ok(rounds), Ok(outcomes)) = (db.count_game_records(), db.count_outcomes()) {
            info!("{} rounds and {} outcomes on disk", rounds, outcomes);
        }
    }

    // Persistence worker
    let persist_tx = db.clone().map(|db| {
        let (tx, rx) = mpsc::channel(PERSIST_QUEUE);
        tokio::spawn(run_persistence(db, rx));
        tx
    });

    // Calibration tracker
    let (cal_tx, cal_rx) = mpsc::channel(CALIBRATION_QUEUE);
    let (report_tx, report_rx) = watch::channel(CalibrationReport::default());
    let tracker = OutcomeCalibrationTracker::new(config.calibration_horizons.clone(), CALIBRATION_LOG);
    tokio::spawn(run_tracker(tracker, cal_rx, report_tx, persist_tx.clone()));

    // Advisor engine
    let machine = PhaseStateMachine::new(config.phase_config());
    let stats = RollingWindowStatistics::new(&config.window_sizes, config.warmup_records);
    let detector = PatternDetector::new(config.pattern_config());
    let classifier = RiskZoneClassifier::new(config.zone_table()?, config.prior_peak());
    let wager = WagerSequenceEngine::new(config.wager_config(), config.stake_sequence()?);
    let outputs = EngineOutputs {
        persist: persist_tx,
        calibration: Some(cal_tx),
    };
    let (mut engine, snapshot_rx) = AdvisorEngine::new(
        config.engine_config(),
        machine,
        stats,
        detector,
        classifier,
        wager,
        outputs,
    );
    engine.preload(&history);

    // Snapshot source
    let (feed_tx, feed_rx) = mpsc::channel(FEED_QUEUE);
    let source: Arc<dyn SnapshotSource> = match &config.replay_file {
        Some(path) => Arc::new(ReplaySource::new(
            path,
            &config.feed_event,
            Duration::from_millis(config.replay_interval_ms),
        )),
        None => Arc::new(WebSocketSource::new(WebSocketSourceConfig {
            name: "live".into(),
            url: config.feed_url.clone(),
            event: config.feed_event.clone(),
            ping_interval_secs: 25,
            max_backoff_secs: 30,
        })),
    };
    info!("Snapshot source: {}", source.name());
    tokio::spawn(async move {
        if let Err(e) = source.run(feed_tx).await {
            error!("Snapshot source {} failed: {}", source.name(), e);
        }
    });

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    tokio::spawn(engine.run(feed_rx, cmd_rx, TIMER_PERIOD));

    // Start the dashboard HTTP server
    let app = dashboard::router(AppState {
        db,
        snapshot: snapshot_rx,
        calibration: report_rx,
        commands: cmd_tx,
        backtest: config.backtest_config()?,
    });
    let addr: SocketAddr = config.dashboard_addr.parse()?;
    info!("Dashboard listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Run dashboard server (blocks until shutdown)
    axum::serve(listener, app).await?;

    Ok(())
}

/// Offline bankroll simulation over the persisted history.
fn backtest(config: &Config) -> Result<()> {
    let db = Database::open(&config.database_path)
        .with_context(|| format!("backtest needs {}", config.database_path))?;
    let cfg = config.backtest_config()?;
    let records = db.recent_game_records(cfg.max_rounds as i64)?;
    info!("Backtesting over {} persisted rounds", records.len());
    let report = run_backtest(&records, &cfg);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

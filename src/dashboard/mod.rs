use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;

use crate::bot::backtest::{run_backtest, BacktestConfig};
use crate::bot::calibration::CalibrationReport;
use crate::bot::{DashboardSnapshot, EngineCommand};
use crate::db::Database;

#[derive(Clone)]
pub struct AppState {
    /// `None` when running without persistence
    pub db: Option<Database>,
    pub snapshot: watch::Receiver<DashboardSnapshot>,
    pub calibration: watch::Receiver<CalibrationReport>,
    pub commands: mpsc::Sender<EngineCommand>,
    pub backtest: BacktestConfig,
}

/// Build the Axum router for the dashboard.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/state", get(state_handler))
        .route("/api/windows", get(windows_handler))
        .route("/api/records", get(records_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/backtest", get(backtest_handler))
        .route("/api/calibration", get(calibration_handler))
        .route("/api/wager/reset", post(wager_reset_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

async fn index_handler() -> impl IntoResponse {
    Html(DASHBOARD_HTML)
}

/// GET /api/state
async fn state_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.snapshot.borrow().clone())
}

/// GET /api/windows
async fn windows_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.snapshot.borrow().windows.clone())
}

#[derive(Debug, Deserialize)]
struct RecordsQuery {
    limit: Option<i64>,
}

/// GET /api/records?limit=100
async fn records_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RecordsQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let Some(db) = state.db.clone() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "persistence disabled".to_string(),
        ));
    };
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);
    tokio::task::spawn_blocking(move || db.recent_game_records(limit))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// GET /api/stats
async fn stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let Some(db) = state.db.clone() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "persistence disabled".to_string(),
        ));
    };
    tokio::task::spawn_blocking(move || db.get_stats())
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// GET /api/backtest?limit=1000
async fn backtest_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RecordsQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let Some(db) = state.db.clone() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "persistence disabled".to_string(),
        ));
    };
    let cfg = state.backtest.clone();
    let limit = q.limit.unwrap_or(cfg.max_rounds as i64).clamp(1, 100_000);
    tokio::task::spawn_blocking(move || {
        db.recent_game_records(limit)
            .map(|records| run_backtest(&records, &cfg))
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map(Json)
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// GET /api/calibration
async fn calibration_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.calibration.borrow().clone())
}

#[derive(Debug, Serialize)]
struct Accepted {
    accepted: bool,
}

/// POST /api/wager/reset
async fn wager_reset_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state
        .commands
        .try_send(EngineCommand::ResetWager)
        .map(|_| (StatusCode::ACCEPTED, Json(Accepted { accepted: true })))
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}

/// Embedded single-file dashboard (HTML + CSS + JS)
const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>rugwatch</title>
<style>
  :root { --bg:#0d0f14; --card:#171a22; --line:#262a36; --text:#e4e4ea; --dim:#8a8aa6;
          --critical:#ff4f6a; --danger:#ff8a3d; --caution:#f5c542; --favorable:#7bd88f; --prime:#00c896; }
  * { box-sizing:border-box; margin:0; padding:0; }
  body { background:var(--bg); color:var(--text); font:14px system-ui, sans-serif; }
  header { padding:1rem 1.5rem; border-bottom:1px solid var(--line); display:flex; gap:1rem; align-items:center; }
  header h1 { font-size:1.2rem; }
  #phase { text-transform:uppercase; font-size:.75rem; padding:.2rem .5rem; border-radius:4px; background:var(--line); }
  main { padding:1.25rem 1.5rem; display:grid; gap:1.25rem; grid-template-columns:repeat(auto-fit, minmax(320px, 1fr)); }
  section { background:var(--card); border:1px solid var(--line); border-radius:8px; padding:1rem; }
  section h2 { font-size:.8rem; color:var(--dim); text-transform:uppercase; letter-spacing:.05em; margin-bottom:.6rem; }
  .big { font-size:1.8rem; font-weight:700; }
  .zone-critical { color:var(--critical); } .zone-danger { color:var(--danger); }
  .zone-caution { color:var(--caution); } .zone-favorable { color:var(--favorable); } .zone-prime { color:var(--prime); }
  table { width:100%; border-collapse:collapse; }
  td, th { text-align:left; padding:.3rem .4rem; border-bottom:1px solid var(--line); font-size:.85rem; }
  th { color:var(--dim); font-weight:500; }
  button { background:var(--line); color:var(--text); border:1px solid var(--dim); border-radius:4px; padding:.3rem .8rem; cursor:pointer; }
  .flag { display:inline-block; margin:.1rem; padding:.1rem .4rem; border-radius:3px; background:#2f2240; font-size:.75rem; }
</style>
</head>
<body>
<header><h1>rugwatch</h1><span id="phase">–</span><span id="round"></span></header>
<main>
  <section><h2>Advice</h2><div id="zone" class="big">–</div><div id="advice"></div><div id="flags"></div></section>
  <section><h2>Wager</h2><div id="wager"></div><br><button onclick="resetWager()">Reset sequence</button></section>
  <section><h2>Windows</h2><table id="windows"></table></section>
  <section><h2>Calibration</h2><div id="calib"></div></section>
  <section><h2>Diagnostics</h2><table id="diag"></table></section>
  <section><h2>Recent rounds</h2><table id="records"></table></section>
</main>
<script>
const fmt = (x, d = 3) => (typeof x === 'number' ? x.toFixed(d) : '–');
function row(cells, tag = 'td') { return '<tr>' + cells.map(c => `<${tag}>${c}</${tag}>`).join('') + '</tr>'; }
async function getJson(p) { const r = await fetch(p); if (!r.ok) throw new Error(r.status); return r.json(); }
async function refreshState() {
  const s = await getJson('/api/state');
  document.getElementById('phase').textContent = s.phase;
  document.getElementById('round').textContent = s.round_id ? `${s.round_id} · tick ${s.tick} · ${fmt(s.price)}x` : '';
  const z = document.getElementById('zone');
  z.textContent = s.zone ? s.zone.name : '–';
  z.className = 'big' + (s.zone ? ' zone-' + s.zone.name : '');
  const a = s.advice;
  document.getElementById('advice').textContent = a.status === 'recommend'
    ? `${a.action} · p=${fmt(a.survival_probability)} · conf=${fmt(a.confidence, 2)} · stake=${fmt(a.suggested_stake, 4)}`
    : a.status.replace(/_/g, ' ');
  const flags = Object.entries(s.patterns).filter(([, v]) => v).map(([k]) => `<span class="flag">${k}</span>`);
  document.getElementById('flags').innerHTML = flags.join('');
  const w = s.wager;
  document.getElementById('wager').innerHTML =
    `bankroll ${fmt(w.bankroll, 4)} · level ${w.sequence_level}/${w.stake_sequence.length} · at risk ${fmt(w.cumulative_risked, 4)}<br>` +
    `${w.status} · ${w.phase} · W${w.wins}/L${w.losses}`;
  document.getElementById('windows').innerHTML = row(['window', 'n', 'mean', 'p50', 'p90', 'early'], 'th') +
    s.windows.map(x => row([x.name, x.stats.count, fmt(x.stats.mean, 1), fmt(x.stats.percentiles.p50, 1),
      fmt(x.stats.percentiles.p90, 1), fmt(x.stats.early_termination_rate, 2)])).join('');
  document.getElementById('diag').innerHTML = Object.entries(s.diagnostics).map(([k, v]) => row([k, v])).join('');
}
async function refreshCalibration() {
  const c = await getJson('/api/calibration');
  const head = `resolved ${c.resolved} · pending ${c.pending} · brier ${fmt(c.brier_score)}`;
  const rows = c.buckets.map(b => row([b.action, b.horizon, b.samples, fmt(b.rate, 2)])).join('');
  document.getElementById('calib').innerHTML = head + '<table>' + row(['action', 'h', 'n', 'rate'], 'th') + rows + '</table>';
}
async function refreshRecords() {
  try {
    const recs = await getJson('/api/records?limit=15');
    document.getElementById('records').innerHTML = row(['round', 'ticks', 'peak', 'flags'], 'th') +
      recs.reverse().map(r => row([r.round_id.slice(-10), r.duration_ticks, fmt(r.peak_value, 2),
        (r.is_early_termination ? 'early ' : '') + (r.incomplete ? 'incomplete' : '')])).join('');
  } catch (e) { document.getElementById('records').innerHTML = row(['persistence disabled']); }
}
async function resetWager() { await fetch('/api/wager/reset', { method: 'POST' }); refreshState(); }
function tick() { refreshState().catch(() => {}); }
tick(); refreshCalibration().catch(() => {}); refreshRecords();
setInterval(tick, 500);
setInterval(() => { refreshCalibration().catch(() => {}); refreshRecords(); }, 5000);
</script>
</body>
</html>
"#;

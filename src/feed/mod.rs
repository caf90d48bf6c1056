pub mod replay;
pub mod socketio;
pub mod websocket;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

/// What a source hands to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Connected { source: String },
    Snapshot(Value),
    Disconnected { source: String, reason: String },
}

/// Every upstream snapshot source implements this. `run` returns once the
/// source is exhausted or the receiver is gone.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, tx: mpsc::Sender<FeedMessage>) -> Result<()>;
}

/// Non-blocking hand-off of one snapshot. A full queue drops the snapshot;
/// returns `false` only when the engine has gone away.
pub fn forward_snapshot(tx: &mpsc::Sender<FeedMessage>, source: &str, payload: Value) -> bool {
    match tx.try_send(FeedMessage::Snapshot(payload)) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("[{}] Engine queue full; snapshot dropped", source);
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

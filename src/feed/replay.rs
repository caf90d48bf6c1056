use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::socketio::{self, Frame};
use super::{FeedMessage, SnapshotSource};

/// Replays recorded snapshots from a JSONL file. Each line is either a bare
/// snapshot object or a captured `42[event, snapshot]` frame.
pub struct ReplaySource {
    path: PathBuf,
    event: String,
    interval: Duration,
}

impl ReplaySource {
    pub fn new(path: impl Into<PathBuf>, event: &str, interval: Duration) -> Self {
        ReplaySource {
            path: path.into(),
            event: event.to_string(),
            interval,
        }
    }

    fn decode_line(&self, line: &str) -> Option<Value> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if line.starts_with("42") {
            return match socketio::parse_frame(line) {
                Frame::Event { name, payload } if name == self.event => Some(payload),
                _ => None,
            };
        }
        serde_json::from_str(line).ok()
    }
}

#[async_trait]
impl SnapshotSource for ReplaySource {
    fn name(&self) -> &str {
        "replay"
    }

    async fn run(&self, tx: mpsc::Sender<FeedMessage>) -> Result<()> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("opening replay file {}", self.path.display()))?;
        let mut lines = BufReader::new(file).lines();
        info!("Replaying snapshots from {}", self.path.display());

        let up = FeedMessage::Connected {
            source: self.name().to_string(),
        };
        if tx.send(up).await.is_err() {
            return Ok(());
        }

        let (mut sent, mut skipped, mut line_no) = (0usize, 0usize, 0usize);
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            let Some(payload) = self.decode_line(&line) else {
                if !line.trim().is_empty() {
                    skipped += 1;
                    warn!("Replay line {} is not a snapshot; skipped", line_no);
                }
                continue;
            };
            // replay is lossless: wait for queue space instead of dropping
            if tx.send(FeedMessage::Snapshot(payload)).await.is_err() {
                return Ok(());
            }
            sent += 1;
            if !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
        }

        info!("Replay finished: {} snapshots, {} skipped", sent, skipped);
        let _ = tx
            .send(FeedMessage::Disconnected {
                source: self.name().to_string(),
                reason: "replay finished".into(),
            })
            .await;
        Ok(())
    }
}

//! Live game feed over WebSocket.
//!
//! ```text
//!  game server ──42[event, snapshot]──▶ WebSocketSource ──FeedMessage──▶ engine
//! ```
//!
//! The connection is read-only apart from protocol upkeep (namespace connect
//! and pong replies). On any failure the loop reports a disconnect and
//! reconnects with exponential backoff plus jitter.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::socketio::{self, Frame};
use super::{forward_snapshot, FeedMessage, SnapshotSource};

#[derive(Debug, Clone)]
pub struct WebSocketSourceConfig {
    pub name: String,
    pub url: String,
    /// Socket.IO event whose payload is a game snapshot
    pub event: String,
    /// Seconds between transport-level ping frames
    pub ping_interval_secs: u64,
    pub max_backoff_secs: u64,
}

pub struct WebSocketSource {
    config: WebSocketSourceConfig,
}

impl WebSocketSource {
    pub fn new(config: WebSocketSourceConfig) -> Self {
        WebSocketSource { config }
    }
}

/// Why a session ended.
enum SessionEnd {
    Dropped(String),
    ReceiverGone,
}

#[async_trait]
impl SnapshotSource for WebSocketSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn run(&self, tx: mpsc::Sender<FeedMessage>) -> Result<()> {
        let name = self.config.name.as_str();
        let mut backoff_secs = 1u64;

        loop {
            info!("[{}] Connecting to {}", name, self.config.url);
            let reason = match tokio_tungstenite::connect_async(self.config.url.as_str()).await {
                Ok((ws_stream, _response)) => {
                    backoff_secs = 1;
                    match self.session(ws_stream, &tx).await {
                        SessionEnd::ReceiverGone => return Ok(()),
                        SessionEnd::Dropped(reason) => reason,
                    }
                }
                Err(e) => {
                    error!("[{}] Connection failed: {}", name, e);
                    format!("connect failed: {}", e)
                }
            };

            let down = FeedMessage::Disconnected {
                source: name.to_string(),
                reason,
            };
            if tx.send(down).await.is_err() {
                return Ok(());
            }

            let jitter_ms = rand::thread_rng().gen_range(0..=backoff_secs * 500);
            let wait = Duration::from_secs(backoff_secs) + Duration::from_millis(jitter_ms);
            warn!("[{}] Reconnecting in {:?}", name, wait);
            tokio::time::sleep(wait).await;
            backoff_secs = (backoff_secs * 2).min(self.config.max_backoff_secs.max(1));
        }
    }
}

impl WebSocketSource {
    async fn session<S>(&self, ws_stream: S, tx: &mpsc::Sender<FeedMessage>) -> SessionEnd
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let name = self.config.name.as_str();
        let (mut write, mut read) = ws_stream.split();
        let mut ping_interval =
            tokio::time::interval(Duration::from_secs(self.config.ping_interval_secs.max(1)));
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match socketio::parse_frame(&text) {
                            Frame::Open { ping_interval_ms } => {
                                debug!("[{}] Handshake (ping interval {:?}ms)", name, ping_interval_ms);
                                if let Err(e) = write.send(Message::Text(socketio::CONNECT.to_string())).await {
                                    return SessionEnd::Dropped(format!("namespace connect failed: {}", e));
                                }
                            }
                            Frame::Connected => {
                                info!("[{}] Subscribed", name);
                                let up = FeedMessage::Connected { source: name.to_string() };
                                if tx.send(up).await.is_err() {
                                    return SessionEnd::ReceiverGone;
                                }
                            }
                            Frame::Ping => {
                                let _ = write.send(Message::Text(socketio::PONG.to_string())).await;
                            }
                            Frame::Event { name: event, payload } if event == self.config.event => {
                                if !forward_snapshot(tx, name, payload) {
                                    return SessionEnd::ReceiverGone;
                                }
                            }
                            Frame::Disconnect => {
                                warn!("[{}] Server disconnected namespace", name);
                                return SessionEnd::Dropped("namespace disconnect".into());
                            }
                            Frame::ConnectError(e) => {
                                error!("[{}] Connect error: {}", name, e);
                                return SessionEnd::Dropped(format!("connect error: {}", e));
                            }
                            Frame::Pong | Frame::Event { .. } | Frame::Other => {}
                        },
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            warn!("[{}] Server closed WebSocket", name);
                            return SessionEnd::Dropped("closed by server".into());
                        }
                        Some(Err(e)) => {
                            error!("[{}] WebSocket error: {}", name, e);
                            return SessionEnd::Dropped(e.to_string());
                        }
                        None => {
                            warn!("[{}] WebSocket stream ended", name);
                            return SessionEnd::Dropped("stream ended".into());
                        }
                        _ => {}
                    }
                }
                _ = ping_interval.tick() => {
                    if let Err(e) = write.send(Message::Ping(vec![])).await {
                        error!("[{}] Ping failed: {}", name, e);
                        return SessionEnd::Dropped(format!("ping failed: {}", e));
                    }
                }
            }
        }
    }
}

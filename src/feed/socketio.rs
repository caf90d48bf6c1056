//! Minimal Engine.IO v4 / Socket.IO text framing. Only what a read-only
//! subscriber needs: open, namespace connect, ping/pong and event frames.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `0{...}` handshake
    Open { ping_interval_ms: Option<u64> },
    /// `2`; must be answered with [`PONG`]
    Ping,
    Pong,
    /// `40` / `40{...}` namespace connect acknowledgement
    Connected,
    /// `41`
    Disconnect,
    /// `44{...}`
    ConnectError(String),
    /// `42[name, payload]`
    Event { name: String, payload: Value },
    Other,
}

pub const CONNECT: &str = "40";
pub const PONG: &str = "3";

pub fn parse_frame(text: &str) -> Frame {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix("42") {
        return parse_event(rest).unwrap_or(Frame::Other);
    }
    if let Some(rest) = text.strip_prefix("44") {
        return Frame::ConnectError(rest.to_string());
    }
    if text.starts_with("40") {
        return Frame::Connected;
    }
    if text.starts_with("41") {
        return Frame::Disconnect;
    }
    match text {
        "2" => Frame::Ping,
        "3" => Frame::Pong,
        _ if text.starts_with('0') => {
            let ping_interval_ms = serde_json::from_str::<Value>(&text[1..])
                .ok()
                .and_then(|v| v.get("pingInterval").and_then(Value::as_u64));
            Frame::Open { ping_interval_ms }
        }
        _ => Frame::Other,
    }
}

/// `[/namespace,][ack-id]["name", payload]`
fn parse_event(rest: &str) -> Option<Frame> {
    let rest = match rest.strip_prefix('/') {
        Some(ns) => &ns[ns.find(',')? + 1..],
        None => rest,
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());
    let mut items = match serde_json::from_str::<Value>(rest).ok()? {
        Value::Array(items) => items.into_iter(),
        _ => return None,
    };
    let name = items.next()?.as_str()?.to_string();
    let payload = items.next().unwrap_or(Value::Null);
    Some(Frame::Event { name, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_control_frames() {
        assert_eq!(
            parse_frame(r#"0{"sid":"x","pingInterval":25000,"pingTimeout":20000}"#),
            Frame::Open {
                ping_interval_ms: Some(25000)
            }
        );
        assert_eq!(parse_frame("2"), Frame::Ping);
        assert_eq!(parse_frame("3"), Frame::Pong);
        assert_eq!(parse_frame(r#"40{"sid":"abc"}"#), Frame::Connected);
        assert_eq!(parse_frame("41"), Frame::Disconnect);
    }

    #[test]
    fn parses_event_frames_with_namespace_and_ack() {
        assert_eq!(
            parse_frame(r#"42["gameStateUpdate",{"tickCount":3}]"#),
            Frame::Event {
                name: "gameStateUpdate".into(),
                payload: json!({"tickCount": 3})
            }
        );
        assert_eq!(
            parse_frame(r#"42/game,17["x",{"a":1}]"#),
            Frame::Event {
                name: "x".into(),
                payload: json!({"a": 1})
            }
        );
        assert_eq!(parse_frame(r#"42{"not":"array"}"#), Frame::Other);
        assert_eq!(parse_frame("hello"), Frame::Other);
    }
}

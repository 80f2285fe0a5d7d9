//! Realtime change feeds over the backend's Phoenix-channel websocket.
//!
//! One socket per channel: the join frame carries the table and filter, the
//! server answers with `phx_reply` and then streams `postgres_changes`
//! frames. A heartbeat on the `phoenix` topic keeps the socket alive.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{ChangeEvent, ChangeKind, ChannelEvent, ChannelSpec, Filter, FilterOp, Row, Subscription};
use crate::config::RealtimeConfig;
use crate::error::BackendError;

const JOIN_REF: &str = "1";
const PHOENIX_TOPIC: &str = "phoenix";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

pub(crate) fn topic_for(spec: &ChannelSpec) -> String {
    format!("realtime:{}", spec.name)
}

pub(crate) fn join_frame(spec: &ChannelSpec, access_token: &str) -> Frame {
    let mut change = json!({
        "event": spec.kind.map(|kind| kind.as_str()).unwrap_or("*"),
        "schema": spec.schema,
        "table": spec.table,
    });
    if let Some(filter) = spec.filter.as_ref().and_then(encode_filter) {
        change["filter"] = Value::String(filter);
    }
    Frame {
        topic: topic_for(spec),
        event: "phx_join".to_string(),
        payload: json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [change],
            },
            "access_token": access_token,
        }),
        reference: Some(JOIN_REF.to_string()),
    }
}

pub(crate) fn heartbeat_frame(reference: u64) -> Frame {
    Frame {
        topic: PHOENIX_TOPIC.to_string(),
        event: "heartbeat".to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
    }
}

pub(crate) fn leave_frame(topic: &str) -> Frame {
    Frame {
        topic: topic.to_string(),
        event: "phx_leave".to_string(),
        payload: json!({}),
        reference: None,
    }
}

/// Realtime filters take a single `column=op.value` predicate.
pub(crate) fn encode_filter(filter: &Filter) -> Option<String> {
    match filter {
        Filter::Cmp {
            column,
            op: op @ (FilterOp::Eq | FilterOp::Neq | FilterOp::Lt | FilterOp::Gt),
            value,
        } => {
            let value = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            Some(format!("{column}={}.{value}", op.as_str()))
        }
        other => {
            warn!("Realtime cannot filter on {other:?}; listening unfiltered");
            None
        }
    }
}

/// Maps an incoming frame on `topic` to a channel event. Frames for other
/// topics and bookkeeping replies map to `None`.
pub(crate) fn decode_frame(topic: &str, frame: Frame) -> Option<ChannelEvent> {
    if frame.topic != topic {
        return None;
    }
    match frame.event.as_str() {
        "phx_reply" if frame.reference.as_deref() == Some(JOIN_REF) => {
            if frame.payload["status"] == "ok" {
                Some(ChannelEvent::Subscribed)
            } else {
                let reason = frame.payload["response"]["reason"]
                    .as_str()
                    .unwrap_or("join rejected");
                Some(ChannelEvent::Error(reason.to_string()))
            }
        }
        "postgres_changes" => decode_change(&frame.payload["data"]).map(ChannelEvent::Change),
        "system" if frame.payload["status"] == "error" => {
            let message = frame.payload["message"]
                .as_str()
                .unwrap_or("realtime system error");
            Some(ChannelEvent::Error(message.to_string()))
        }
        "phx_error" => Some(ChannelEvent::Error("channel error".to_string())),
        "phx_close" => Some(ChannelEvent::Closed),
        _ => None,
    }
}

fn decode_change(data: &Value) -> Option<ChangeEvent> {
    let kind = ChangeKind::parse(data["type"].as_str()?)?;
    let table = data["table"].as_str().unwrap_or_default().to_string();
    let image = |key: &str| -> Option<Row> {
        match data.get(key) {
            Some(Value::Object(row)) if !row.is_empty() => Some(row.clone()),
            _ => None,
        }
    };
    let new = match kind {
        ChangeKind::Delete => None,
        _ => image("record"),
    };
    Some(ChangeEvent {
        kind,
        table,
        new,
        old: image("old_record"),
    })
}

/// Opens a socket, joins the channel and returns the live subscription.
/// Join success or failure arrives as the first event.
pub async fn connect(
    url: &str,
    spec: ChannelSpec,
    access_token: String,
    config: &RealtimeConfig,
) -> Result<Subscription, BackendError> {
    let (socket, _) = timeout(config.join_timeout(), connect_async(url))
        .await
        .map_err(|_| BackendError::transport("realtime connect timed out"))?
        .map_err(|err| BackendError::transport(format!("realtime connect failed: {err}")))?;
    debug!("Realtime socket connected for channel {}", spec.name);
    let (mut write, mut read) = socket.split();

    let topic = topic_for(&spec);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let (events_tx, events_rx) = mpsc::unbounded_channel::<ChannelEvent>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    warn!("Dropping unencodable realtime frame: {err}");
                    continue;
                }
            };
            if write.send(Message::text(text)).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    let reader_topic = topic.clone();
    let join_timeout = config.join_timeout();
    let reader = tokio::spawn(async move {
        let join_deadline = tokio::time::sleep(join_timeout);
        tokio::pin!(join_deadline);
        let mut joined = false;
        loop {
            let message = tokio::select! {
                message = read.next() => message,
                _ = &mut join_deadline, if !joined => {
                    let _ = events_tx.send(ChannelEvent::Error(format!(
                        "join timed out after {}ms",
                        join_timeout.as_millis()
                    )));
                    joined = true;
                    continue;
                }
            };
            match message {
                Some(Ok(message)) if message.is_text() => {
                    let Ok(text) = message.to_text() else { continue };
                    let frame = match serde_json::from_str::<Frame>(text) {
                        Ok(frame) => frame,
                        Err(err) => {
                            debug!("Ignoring malformed realtime frame: {err}");
                            continue;
                        }
                    };
                    let Some(event) = decode_frame(&reader_topic, frame) else { continue };
                    if matches!(event, ChannelEvent::Subscribed | ChannelEvent::Error(_)) {
                        joined = true;
                    }
                    let closed = event == ChannelEvent::Closed;
                    if events_tx.send(event).is_err() || closed {
                        return;
                    }
                }
                Some(Ok(message)) if message.is_close() => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("Realtime socket error on {reader_topic}: {err}");
                    let _ = events_tx.send(ChannelEvent::Error(err.to_string()));
                    break;
                }
                None => break,
            }
        }
        let _ = events_tx.send(ChannelEvent::Closed);
    });

    let heartbeat_tx = out_tx.clone();
    let interval = config.heartbeat_interval();
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        let mut reference: u64 = 1;
        loop {
            ticker.tick().await;
            reference += 1;
            if heartbeat_tx.send(heartbeat_frame(reference)).is_err() {
                break;
            }
        }
    });

    out_tx
        .send(join_frame(&spec, &access_token))
        .map_err(|_| BackendError::transport("realtime writer stopped before join"))?;

    Ok(Subscription::new(spec.name, events_rx, move || {
        heartbeat.abort();
        reader.abort();
        if out_tx.send(leave_frame(&topic)).is_err() {
            debug!("Realtime writer already stopped for {topic}");
        }
        // Writer drains the leave frame, then closes once every sender is gone.
        drop(out_tx);
        drop(writer);
    }))
}

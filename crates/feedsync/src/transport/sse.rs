//! Server-sent event tier: `GET <stream>?after=<cursor>` decoded into [`Inbound`].
//!
//! The endpoint emits `connected`, `heartbeat {ts}` and `insert {items, cursor}`
//! events. A malformed payload becomes `Err(Protocol)` for that one event; the
//! stream itself keeps going.

use futures_util::{stream, StreamExt};
use serde::Deserialize;

use super::{Inbound, InboundStream};
use crate::cursor::Cursor;
use crate::error::FeedError;
use crate::item::{newest, Item};

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder. Feed it raw body chunks in order.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut out = Vec::new();
        for &b in chunk {
            if b == b'\n' {
                let mut line = std::mem::take(&mut self.line);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if let Some(ev) = self.take_line(&String::from_utf8_lossy(&line)) {
                    out.push(ev);
                }
            } else {
                self.line.push(b);
            }
        }
        out
    }

    fn take_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            let event = self.event.take();
            if self.data.is_empty() {
                return None;
            }
            let data = std::mem::take(&mut self.data).join("\n");
            return Some(SseEvent {
                event: event.unwrap_or_else(|| "message".into()),
                data,
            });
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

#[derive(Debug, Deserialize)]
struct HeartbeatPayload {
    #[allow(dead_code)]
    ts: i64,
}

#[derive(Debug, Deserialize)]
struct InsertPayload {
    items: Vec<Item>,
    #[serde(default)]
    cursor: Option<Cursor>,
}

/// Map one event to what the session cares about. Unknown event names are skipped.
pub fn decode_event(ev: &SseEvent) -> Result<Option<Inbound>, FeedError> {
    match ev.event.as_str() {
        "connected" => Ok(Some(Inbound::Subscribed)),
        "heartbeat" => {
            let _: HeartbeatPayload = serde_json::from_str(&ev.data)
                .map_err(|e| FeedError::Protocol(format!("heartbeat: {e}")))?;
            Ok(Some(Inbound::Heartbeat))
        }
        "insert" => {
            let payload: InsertPayload = serde_json::from_str(&ev.data)
                .map_err(|e| FeedError::Protocol(format!("insert: {e}")))?;
            let cursor = payload
                .cursor
                .or_else(|| newest(&payload.items).map(Cursor::new));
            Ok(Some(Inbound::Items {
                items: payload.items,
                cursor,
            }))
        }
        other => {
            tracing::debug!(event = other, "ignoring stream event");
            Ok(None)
        }
    }
}

/// Open the event stream and decode it lazily.
pub async fn open(
    client: &reqwest::Client,
    url: url::Url,
    cursor: Cursor,
) -> Result<InboundStream, FeedError> {
    let resp = client
        .get(url.clone())
        .query(&[("after", cursor.to_query())])
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .header(reqwest::header::CACHE_CONTROL, "no-cache")
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(FeedError::Status {
            status: resp.status().as_u16(),
            url: url.to_string(),
        });
    }
    let mut decoder = SseDecoder::default();
    let events = resp
        .bytes_stream()
        .map(move |chunk| match chunk {
            Ok(bytes) => decoder
                .push(&bytes)
                .iter()
                .filter_map(|ev| decode_event(ev).transpose())
                .collect::<Vec<_>>(),
            Err(e) => vec![Err(FeedError::from(e))],
        })
        .flat_map(stream::iter);
    Ok(events.boxed())
}

//! Push-channel tier: insert notifications over a WebSocket.
//!
//! Wire protocol (JSON text frames):
//! - client → server: `{"type":"subscribe","topic":"news"}`
//! - server → client: `{"type":"subscribed"}`, `{"type":"heartbeat"}`,
//!   `{"type":"insert","record":{...item...}}`, `{"type":"error","message":"..."}`
//!
//! An `error` frame fails the tier. Frames that do not parse are protocol errors and
//! are skipped by the session.

use futures_util::{stream, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{Inbound, InboundStream, Tier};
use crate::cursor::Cursor;
use crate::error::FeedError;
use crate::item::Item;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum PushFrame {
    Subscribed,
    Heartbeat,
    Insert { record: Item },
    Error {
        #[serde(default)]
        message: String,
    },
}

/// Decode one text frame.
pub fn decode_frame(text: &str) -> Result<Inbound, FeedError> {
    let frame: PushFrame =
        serde_json::from_str(text).map_err(|e| FeedError::Protocol(format!("push frame: {e}")))?;
    match frame {
        PushFrame::Subscribed => Ok(Inbound::Subscribed),
        PushFrame::Heartbeat => Ok(Inbound::Heartbeat),
        PushFrame::Insert { record } => {
            let cursor = Some(Cursor::new(record.published_at));
            Ok(Inbound::Items {
                items: vec![record],
                cursor,
            })
        }
        PushFrame::Error { message } => Err(FeedError::TransportDegraded {
            from: Tier::Push,
            reason: format!("server rejected subscription: {message}"),
        }),
    }
}

/// Connect, send the subscribe frame, and hand back the decoded frame stream.
/// Confirmation arrives as [`Inbound::Subscribed`] on the stream.
pub async fn open(url: &str, topic: &str) -> Result<InboundStream, FeedError> {
    let (mut ws, _) = connect_async(url).await?;
    let subscribe = json!({ "type": "subscribe", "topic": topic });
    ws.send(Message::Text(serde_json::to_string(&subscribe)?))
        .await?;
    tracing::debug!(url, topic, "push subscribe sent");

    let frames = stream::unfold(Some(ws), |ws| async move {
        let mut ws = ws?;
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Some((decode_frame(&text), Some(ws))),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                // The socket is unusable after a transport error; end after reporting it.
                Some(Err(e)) => return Some((Err(FeedError::from(e)), None)),
            }
        }
    });
    Ok(frames.boxed())
}

//! Websocket transports
//!
//! Both sides exchange one JSON object per frame. Text frames are the norm;
//! binary frames carrying JSON are accepted as well. Each binding owns a
//! private single-worker Tokio runtime and drives it from its worker thread.

mod client;
mod server;

pub use client::WebsocketClientTransport;
pub use server::WebsocketServerTransport;

use super::codec::decode_payload;
use crate::error::{RadapterError, Result};
use crate::message::{Message, Payload};
use tokio::runtime::Runtime;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

/// Build the runtime a websocket binding runs its I/O on
fn build_runtime(name: &str) -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name(format!("ws-{}", name))
        .enable_all()
        .build()
        .map_err(|e| RadapterError::Connect(format!("Failed to start I/O runtime: {}", e)))
}

/// Encode a message as a text frame
fn to_frame(message: &Message) -> Result<WsMessage> {
    let text = serde_json::to_string(message.payload())?;
    Ok(WsMessage::Text(text.into()))
}

/// Decode a data frame; control frames yield `None`
fn from_frame(frame: &WsMessage) -> Option<Result<Payload>> {
    match frame {
        WsMessage::Text(text) => Some(decode_payload(text.as_bytes())),
        WsMessage::Binary(bytes) => Some(decode_payload(bytes)),
        _ => None,
    }
}

fn ws_error(e: tungstenite::Error) -> RadapterError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            RadapterError::Disconnected("websocket closed".to_string())
        }
        tungstenite::Error::Io(io) => RadapterError::Io(io),
        other => RadapterError::Send(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BindingId;
    use serde_json::json;

    #[test]
    fn test_frame_codec() {
        let message = Message::from_value(BindingId::new("ws"), json!({"a": 1}));
        let frame = to_frame(&message).unwrap();
        assert!(frame.is_text());
        let payload = from_frame(&frame).unwrap().unwrap();
        assert_eq!(&payload, message.payload());

        let binary = WsMessage::Binary(br#"{"b":2}"#.to_vec().into());
        assert_eq!(from_frame(&binary).unwrap().unwrap()["b"], json!(2));

        assert!(from_frame(&WsMessage::Ping(Vec::new().into())).is_none());
        assert!(from_frame(&WsMessage::Text("{oops".into())).unwrap().is_err());
    }

    #[test]
    fn test_error_mapping() {
        assert!(ws_error(tungstenite::Error::ConnectionClosed).is_connection_loss());
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(ws_error(tungstenite::Error::Io(io)).is_transient());
    }
}

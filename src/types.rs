//! WebSocket wire protocol (ambient transport, grounded in the teacher's
//! `types.rs`): tagged JSON enums carrying the richer `ErrorKind`/`Tag` types
//! from the reader loop instead of bare strings.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::reader_loop::{StatusUpdate, TagEvent};
use crate::tags::TagFamily;

/// Messages pushed to every connected WebSocket client.
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum OutgoingMessage {
    READER_CONNECTED,
    READER_DISCONNECTED,
    READER_COOLDOWN,
    TAG_UNSUPPORTED { atr: String },
    DATA_READ_SUCCESS { uid: String, family: String, data: String },
    DATA_READ_ERROR { uid: Option<String>, error: String },
    DATA_WRITE_SUCCESS,
    DATA_WRITE_ERROR { error: String },
}

impl From<&TagEvent> for OutgoingMessage {
    fn from(event: &TagEvent) -> Self {
        match event {
            TagEvent::Status(StatusUpdate::Cooldown) => OutgoingMessage::READER_COOLDOWN,
            TagEvent::Status(StatusUpdate::Disconnected) => OutgoingMessage::READER_DISCONNECTED,
            TagEvent::Status(StatusUpdate::Unsupported { atr }) => {
                OutgoingMessage::TAG_UNSUPPORTED { atr: hex::encode(atr) }
            }
            TagEvent::Data { uid, family, data } => OutgoingMessage::DATA_READ_SUCCESS {
                uid: uid.clone(),
                family: family_str(*family),
                data: hex::encode(data),
            },
            TagEvent::Error { uid, error } => {
                OutgoingMessage::DATA_READ_ERROR { uid: uid.clone(), error: error.to_string() }
            }
        }
    }
}

fn family_str(family: TagFamily) -> String {
    family.as_str().to_string()
}

pub fn write_result_message(result: &Result<(), ErrorKind>) -> OutgoingMessage {
    match result {
        Ok(()) => OutgoingMessage::DATA_WRITE_SUCCESS,
        Err(e) => OutgoingMessage::DATA_WRITE_ERROR { error: e.to_string() },
    }
}

/// Messages received from a WebSocket client.
#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
pub enum IncomingMessage {
    GET_READER_STATUS,
    WRITE_DATA { data: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_status_hex_encodes_atr() {
        let event = TagEvent::Status(StatusUpdate::Unsupported { atr: vec![0x3b, 0x80] });
        let msg = OutgoingMessage::from(&event);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"atr\":\"3b80\""));
    }

    #[test]
    fn incoming_write_data_parses_from_json() {
        let parsed: IncomingMessage =
            serde_json::from_str(r#"{"type":"WRITE_DATA","data":"48656c6c6f"}"#).unwrap();
        assert!(matches!(parsed, IncomingMessage::WRITE_DATA { data } if data == "48656c6c6f"));
    }
}

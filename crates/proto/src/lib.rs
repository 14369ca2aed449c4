use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub const MAX_FRAME_LEN: usize = 256 * 1024;
pub const MAX_MESSAGE_ID_LEN: usize = 128;

/// Delivery progress of a message as observed by its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Sent,
    Received,
    Delivered,
    Read,
    Error,
}

impl DeliveryState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Received => "received",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Error => "error",
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    /// Error is terminal.
    pub fn can_advance_to(self, next: DeliveryState) -> bool {
        match self {
            Self::Sent => matches!(next, Self::Received | Self::Delivered | Self::Error),
            Self::Received | Self::Delivered => matches!(next, Self::Delivered | Self::Read),
            Self::Read | Self::Error => false,
        }
    }
}

impl Display for DeliveryState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryState {
    type Err = CodecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sent" => Ok(Self::Sent),
            "received" => Ok(Self::Received),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "error" => Ok(Self::Error),
            _ => Err(CodecError::InvalidState),
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    MalformedJson,
    MissingId,
    MissingReceiver,
    MessageIdTooLong,
    FrameTooLarge,
    InvalidState,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedJson => write!(f, "malformed frame payload"),
            Self::MissingId => write!(f, "frame is missing a message id"),
            Self::MissingReceiver => write!(f, "frame is missing a receiver"),
            Self::MessageIdTooLong => write!(f, "message id exceeds limits"),
            Self::FrameTooLarge => write!(f, "frame exceeds limits"),
            Self::InvalidState => write!(f, "unknown delivery state"),
        }
    }
}

impl Error for CodecError {}

/// One JSON frame received from a live client connection.
///
/// Absence of `state` marks a new message; presence marks a status update
/// the peer is reporting back (e.g. read receipts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: String,
    #[serde(default)]
    pub content: String,
    pub receiver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<DeliveryState>,
}

impl ClientFrame {
    /// Parses and validates a raw frame from the wire.
    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        if raw.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge);
        }
        let frame: ClientFrame =
            serde_json::from_slice(raw).map_err(|_| CodecError::MalformedJson)?;
        if frame.id.is_empty() {
            return Err(CodecError::MissingId);
        }
        if frame.id.len() > MAX_MESSAGE_ID_LEN {
            return Err(CodecError::MessageIdTooLong);
        }
        if frame.receiver.is_empty() {
            return Err(CodecError::MissingReceiver);
        }
        Ok(frame)
    }

    pub fn is_status_update(&self) -> bool {
        self.state.is_some()
    }

    /// Serializes the frame for delivery to the receiver: the receiver field
    /// is stripped and the authenticated sender is stamped in.
    pub fn delivery_payload(&self, sender: &str) -> Value {
        json!({
            "id": self.id,
            "content": self.content,
            "sender": sender,
        })
    }
}

/// Status notification pushed back over a live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFrame {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub state: DeliveryState,
}

impl StatusFrame {
    pub fn new(message_id: &str, state: DeliveryState) -> Self {
        Self {
            message_id: message_id.to_string(),
            state,
        }
    }

    pub fn encode(&self) -> String {
        json!({
            "messageId": self.message_id,
            "state": self.state.as_str(),
        })
        .to_string()
    }
}

/// In-band error answer; the connection stays open after sending one.
pub fn error_frame(reason: &str) -> String {
    json!({ "error": reason }).to_string()
}

/// Error status referencing a specific message id, e.g. for an unknown
/// receiver.
pub fn error_status_frame(message_id: &str, reason: &str) -> String {
    json!({
        "messageId": message_id,
        "state": DeliveryState::Error.as_str(),
        "error": reason,
    })
    .to_string()
}

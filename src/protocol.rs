//! Wire protocol - JSON objects discriminated by a `type` field

use crate::contacts::{Contact, ContactEntry};
use crate::devices::Device;
use crate::messages::{Message, MessageStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// A decoded request. Unit variants ignore any extra fields.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Identify {
        #[serde(alias = "name")]
        device: String,
        #[serde(default)]
        device_id: Option<String>,
    },
    Ping,
    GetContacts,
    SyncContacts {
        contacts: Vec<ContactEntry>,
    },
    SendMessage {
        id: String,
        to: String,
        text: String,
    },
    SmsStatus {
        id: String,
        status: MessageStatus,
    },
    GetStatus,
    GetMessages,
    GetPending,
}

impl Request {
    /// Every `type` value this host understands
    pub const KINDS: &'static [&'static str] = &[
        "identify",
        "ping",
        "get_contacts",
        "sync_contacts",
        "send_message",
        "sms_status",
        "get_status",
        "get_messages",
        "get_pending",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Request::Identify { .. } => "identify",
            Request::Ping => "ping",
            Request::GetContacts => "get_contacts",
            Request::SyncContacts { .. } => "sync_contacts",
            Request::SendMessage { .. } => "send_message",
            Request::SmsStatus { .. } => "sms_status",
            Request::GetStatus => "get_status",
            Request::GetMessages => "get_messages",
            Request::GetPending => "get_pending",
        }
    }
}

/// Why a single request could not be decoded. The connection stays usable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("request must be a JSON object")]
    NotAnObject,

    #[error("request has no 'type' field")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("malformed {kind} request: {reason}")]
    Malformed { kind: String, reason: String },
}

/// Turn one framed JSON value into a request
pub fn decode(value: Value) -> Result<Request, ProtocolError> {
    let kind = match value.as_object().map(|obj| obj.get("type")) {
        None => return Err(ProtocolError::NotAnObject),
        Some(Some(Value::String(kind))) => kind.clone(),
        Some(_) => return Err(ProtocolError::MissingType),
    };

    if !Request::KINDS.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
        kind,
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ack {
        status: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        count: Option<usize>,
    },
    Pong,
    Contacts {
        data: BTreeMap<String, Contact>,
    },
    Messages {
        data: BTreeMap<String, Message>,
    },
    Pending {
        data: BTreeMap<String, Message>,
    },
    Status {
        devices_connected: usize,
        contacts_count: usize,
        messages_count: usize,
        devices: Vec<Device>,
        timestamp: String,
    },
    Error {
        message: String,
    },
}

impl Response {
    pub fn ack_id(status: &'static str, id: &str) -> Self {
        Response::Ack {
            status,
            id: Some(id.to_string()),
            device_id: None,
            count: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }

    /// Serialized form written to the socket, newline-terminated
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

impl From<ProtocolError> for Response {
    fn from(err: ProtocolError) -> Self {
        Response::error(err.to_string())
    }
}

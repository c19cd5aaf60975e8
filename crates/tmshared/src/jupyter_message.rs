//
// jupyter_message.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The header of a Jupyter message.
///
/// Every field except `date` is required by the messaging protocol; incoming
/// headers are deserialized leniently (missing fields become empty strings)
/// and rejected later by the validator so that a malformed frame can be
/// logged rather than surfaced as a parse error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JupyterMessageHeader {
    /// The message ID; unique for every sent message
    #[serde(default)]
    pub msg_id: String,

    /// The type of the message
    #[serde(default)]
    pub msg_type: String,

    /// The name of the user that sent the message
    #[serde(default)]
    pub username: String,

    /// The client session that sent the message
    #[serde(default)]
    pub session: String,

    /// The messaging protocol version
    #[serde(default)]
    pub version: String,

    /// ISO 8601 timestamp; not all servers stamp it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// The set of all Jupyter WebSocket channels over which messages are sent and
/// received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JupyterChannel {
    /// The shell channel
    Shell,

    /// The control channel
    Control,

    /// The stdin channel
    Stdin,

    /// The iopub channel
    IOPub,
}

/// A Jupyter message in structured form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JupyterMessage {
    /// The header of the message
    pub header: JupyterMessageHeader,

    /// The header of the message's parent (the message that caused this
    /// message); serialized as an empty object when absent
    #[serde(
        default,
        serialize_with = "serialize_parent",
        deserialize_with = "deserialize_parent"
    )]
    pub parent_header: Option<JupyterMessageHeader>,

    /// The channel on which the message was sent (or is to be sent)
    pub channel: JupyterChannel,

    /// The message payload
    #[serde(default)]
    pub content: serde_json::Value,

    /// Additional metadata
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// Binary buffers; these never appear in the JSON body, they ride in the
    /// binary tail of the wire frame
    #[serde(skip)]
    pub buffers: Vec<Bytes>,
}

impl JupyterMessage {
    /// The parent message ID, if the message has a parent.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header
            .as_ref()
            .map(|header| header.msg_id.as_str())
    }
}

/// The execution states a kernel reports on its iopub `status` messages.
///
/// `Reconnecting` is never sent by a server; it exists for transitions the
/// client injects while the socket is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Starting,
    Idle,
    Busy,
    Restarting,
    Dead,
    Reconnecting,
}

/// The content of an iopub `status` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JupyterStatus {
    /// The kernel's execution state
    pub execution_state: ExecutionState,
}

fn serialize_parent<S>(
    value: &Option<JupyterMessageHeader>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(header) => header.serialize(serializer),
        None => serde_json::Map::new().serialize(serializer),
    }
}

fn deserialize_parent<'de, D>(deserializer: D) -> Result<Option<JupyterMessageHeader>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(ref map) if map.is_empty() => Ok(None),
        other => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

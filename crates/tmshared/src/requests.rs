//
// requests.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Typed contents for the shell requests the client sends and the replies it
//! expects back. These are in no way exhaustive of the Jupyter protocol; they
//! cover the request types the kernel channel engine exposes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The content of an `execute_request` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// The code to execute
    pub code: String,

    /// Whether to execute silently (no history, no broadcast of the input)
    pub silent: bool,

    /// Whether to store the code in the kernel's history
    pub store_history: bool,

    /// Mapping of names to expressions to evaluate after the code runs
    pub user_expressions: serde_json::Map<String, Value>,

    /// Whether the kernel may issue stdin requests while executing
    pub allow_stdin: bool,

    /// Whether to abort queued execution on error
    pub stop_on_error: bool,
}

impl ExecuteRequest {
    /// Create an execute request for the given code with the protocol
    /// defaults for everything else.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }
}

impl Default for ExecuteRequest {
    fn default() -> Self {
        Self {
            code: String::new(),
            silent: false,
            store_history: true,
            user_expressions: serde_json::Map::new(),
            allow_stdin: true,
            stop_on_error: false,
        }
    }
}

/// The content of an `execute_reply` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteReply {
    /// The execution status ("ok", "error", or "abort")
    pub status: String,

    /// The execution counter
    #[serde(default)]
    pub execution_count: u64,
}

/// The content of a `complete_request` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    /// The code in which completion is requested
    pub code: String,

    /// The cursor position within `code`, in unicode code points
    pub cursor_pos: u64,
}

/// The content of a `complete_reply` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteReply {
    /// The execution status
    pub status: String,

    /// The completion matches
    #[serde(default)]
    pub matches: Vec<String>,

    /// The start of the range to replace with a match
    #[serde(default)]
    pub cursor_start: u64,

    /// The end of the range to replace with a match
    #[serde(default)]
    pub cursor_end: u64,

    /// Extra information, as a free-form mapping
    #[serde(default)]
    pub metadata: Value,
}

/// The content of an `inspect_request` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectRequest {
    /// The code containing the object to inspect
    pub code: String,

    /// The cursor position within `code`
    pub cursor_pos: u64,

    /// 0 for basic detail, 1 for extended detail
    pub detail_level: u8,
}

/// The content of an `inspect_reply` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectReply {
    /// The execution status
    pub status: String,

    /// Whether the object was found
    pub found: bool,

    /// The inspection result, as a MIME bundle
    #[serde(default)]
    pub data: Value,

    /// Metadata for the MIME bundle
    #[serde(default)]
    pub metadata: Value,
}

/// The content of a `history_request` message.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryRequest {
    /// Whether to include output with the history
    #[serde(default)]
    pub output: bool,

    /// Whether to return the raw input history
    #[serde(default)]
    pub raw: bool,

    /// One of "range", "tail", or "search"
    #[serde(default)]
    pub hist_access_type: String,

    /// For "range": the session to fetch from
    pub session: Option<i64>,

    /// For "range": the first cell to fetch
    pub start: Option<i64>,

    /// For "range": the last cell to fetch
    pub stop: Option<i64>,

    /// For "tail" and "search": the number of cells to fetch
    pub n: Option<i64>,

    /// For "search": the glob pattern to match
    pub pattern: Option<String>,

    /// For "search": whether to omit duplicate entries
    pub unique: Option<bool>,
}

/// The content of a `history_reply` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryReply {
    /// The history entries
    #[serde(default)]
    pub history: Vec<Value>,
}

/// The content of an `is_complete_request` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsCompleteRequest {
    /// The code to check for completeness
    pub code: String,
}

/// The content of an `is_complete_reply` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsCompleteReply {
    /// One of "complete", "incomplete", "invalid", or "unknown"
    pub status: String,

    /// For "incomplete": the characters to use to indent the next line
    #[serde(default)]
    pub indent: Option<String>,
}

/// The content of a `comm_info_request` message.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommInfoRequest {
    /// Restrict the reply to comms with this target name
    pub target_name: Option<String>,
}

/// The content of a `comm_info_reply` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommInfoReply {
    /// The open comms, keyed by comm ID
    #[serde(default)]
    pub comms: HashMap<String, Value>,
}

/// The content of an `input_request` message, received on the stdin channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRequest {
    /// The prompt to display
    #[serde(default)]
    pub prompt: String,

    /// Whether the input is a password (should not be echoed)
    #[serde(default)]
    pub password: bool,
}

/// The content of an `input_reply` message, sent on the stdin channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputReply {
    /// The value the user supplied
    pub value: String,
}

/// The content of a `comm_open` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommOpen {
    /// The comm ID
    pub comm_id: String,

    /// The comm target name
    pub target_name: String,

    /// An optional module to resolve the target from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_module: Option<String>,

    /// The payload of the open message
    #[serde(default)]
    pub data: Value,
}

/// The content of a `comm_msg` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommMsg {
    /// The comm ID
    pub comm_id: String,

    /// The payload of the message
    #[serde(default)]
    pub data: Value,
}

/// The content of a `comm_close` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommClose {
    /// The comm ID
    pub comm_id: String,

    /// The payload of the close message
    #[serde(default)]
    pub data: Value,
}

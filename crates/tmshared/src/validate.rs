//
// validate.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Validation predicates for incoming Jupyter messages.
//!
//! The engine validates every decoded frame before routing it. Messages with
//! malformed headers or per-type content are dropped with a logged error;
//! message types this module does not know about pass validation and are
//! forwarded as unhandled.

use serde_json::Value;
use thiserror::Error;

use crate::jupyter_message::JupyterMessage;

/// The ways a message can fail validation.
#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("message header is missing required field '{0}'")]
    MissingHeaderField(&'static str),

    #[error("'{msg_type}' content is missing required field '{field}'")]
    MissingField { msg_type: String, field: &'static str },

    #[error("'{msg_type}' field '{field}' has invalid value {value}")]
    BadValue {
        msg_type: String,
        field: &'static str,
        value: String,
    },
}

/// Validate a decoded message: header well-formedness plus per-type content
/// shape for the message types the engine routes.
pub fn validate_message(msg: &JupyterMessage) -> Result<(), ValidateError> {
    let header = &msg.header;
    if header.msg_id.is_empty() {
        return Err(ValidateError::MissingHeaderField("msg_id"));
    }
    if header.msg_type.is_empty() {
        return Err(ValidateError::MissingHeaderField("msg_type"));
    }
    if header.session.is_empty() {
        return Err(ValidateError::MissingHeaderField("session"));
    }
    if header.username.is_empty() {
        return Err(ValidateError::MissingHeaderField("username"));
    }
    if header.version.is_empty() {
        return Err(ValidateError::MissingHeaderField("version"));
    }

    let msg_type = header.msg_type.as_str();
    let content = &msg.content;
    match msg_type {
        "status" => {
            let state = require_str(content, msg_type, "execution_state")?;
            match state {
                "starting" | "idle" | "busy" | "restarting" | "dead" | "reconnecting" => {}
                other => {
                    return Err(bad_value(msg_type, "execution_state", other));
                }
            }
        }
        "execute_reply" => {
            let status = require_str(content, msg_type, "status")?;
            match status {
                "ok" | "error" | "abort" => {}
                other => return Err(bad_value(msg_type, "status", other)),
            }
            require_uint(content, msg_type, "execution_count")?;
        }
        "execute_input" => {
            require_str(content, msg_type, "code")?;
            require_uint(content, msg_type, "execution_count")?;
        }
        "execute_result" => {
            require_object(content, msg_type, "data")?;
            require_uint(content, msg_type, "execution_count")?;
        }
        "display_data" => {
            require_object(content, msg_type, "data")?;
        }
        "stream" => {
            let name = require_str(content, msg_type, "name")?;
            match name {
                "stdout" | "stderr" => {}
                other => return Err(bad_value(msg_type, "name", other)),
            }
            require_str(content, msg_type, "text")?;
        }
        "error" => {
            require_str(content, msg_type, "ename")?;
            require_str(content, msg_type, "evalue")?;
            require_array(content, msg_type, "traceback")?;
        }
        "comm_open" => {
            require_str(content, msg_type, "comm_id")?;
            require_str(content, msg_type, "target_name")?;
        }
        "comm_msg" | "comm_close" => {
            require_str(content, msg_type, "comm_id")?;
        }
        "input_request" => {
            require_str(content, msg_type, "prompt")?;
            require_bool(content, msg_type, "password")?;
        }
        "kernel_info_reply" | "is_complete_reply" => {
            require_str(content, msg_type, "status")?;
        }
        "complete_reply" => {
            require_str(content, msg_type, "status")?;
            require_array(content, msg_type, "matches")?;
            require_uint(content, msg_type, "cursor_start")?;
            require_uint(content, msg_type, "cursor_end")?;
        }
        "inspect_reply" => {
            require_str(content, msg_type, "status")?;
            require_bool(content, msg_type, "found")?;
        }
        "history_reply" => {
            require_array(content, msg_type, "history")?;
        }
        "comm_info_reply" => {
            require_object(content, msg_type, "comms")?;
        }
        // Unknown message types are tolerated; the engine forwards them as
        // unhandled.
        _ => {}
    }

    Ok(())
}

fn bad_value(msg_type: &str, field: &'static str, value: &str) -> ValidateError {
    ValidateError::BadValue {
        msg_type: msg_type.to_string(),
        field,
        value: value.to_string(),
    }
}

fn get_field<'a>(
    content: &'a Value,
    msg_type: &str,
    field: &'static str,
) -> Result<&'a Value, ValidateError> {
    content.get(field).ok_or_else(|| ValidateError::MissingField {
        msg_type: msg_type.to_string(),
        field,
    })
}

fn require_str<'a>(
    content: &'a Value,
    msg_type: &str,
    field: &'static str,
) -> Result<&'a str, ValidateError> {
    let value = get_field(content, msg_type, field)?;
    value
        .as_str()
        .ok_or_else(|| bad_value(msg_type, field, &value.to_string()))
}

fn require_uint(content: &Value, msg_type: &str, field: &'static str) -> Result<u64, ValidateError> {
    let value = get_field(content, msg_type, field)?;
    value
        .as_u64()
        .ok_or_else(|| bad_value(msg_type, field, &value.to_string()))
}

fn require_bool(content: &Value, msg_type: &str, field: &'static str) -> Result<bool, ValidateError> {
    let value = get_field(content, msg_type, field)?;
    value
        .as_bool()
        .ok_or_else(|| bad_value(msg_type, field, &value.to_string()))
}

fn require_object(
    content: &Value,
    msg_type: &str,
    field: &'static str,
) -> Result<(), ValidateError> {
    let value = get_field(content, msg_type, field)?;
    if value.is_object() {
        Ok(())
    } else {
        Err(bad_value(msg_type, field, &value.to_string()))
    }
}

fn require_array(
    content: &Value,
    msg_type: &str,
    field: &'static str,
) -> Result<(), ValidateError> {
    let value = get_field(content, msg_type, field)?;
    if value.is_array() {
        Ok(())
    } else {
        Err(bad_value(msg_type, field, &value.to_string()))
    }
}

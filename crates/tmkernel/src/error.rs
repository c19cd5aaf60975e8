//
// error.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use thiserror::Error;

/// The public error taxonomy of the Themisto client.
///
/// REST failures propagate to the caller that issued the operation; WebSocket
/// decode and validation failures never do (the offending frame is logged and
/// dropped so a corrupted frame cannot wedge the engine).
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// An operation was attempted on a terminal engine
    #[error("the kernel is dead")]
    KernelDead,

    /// Outstanding work was aborted because the engine died or the handle was
    /// disposed
    #[error("the kernel connection was terminated")]
    KernelTerminated,

    /// A REST call returned a status outside its documented success code
    #[error("unexpected response from server ({status}): {body}")]
    InvalidResponse { status: u16, body: String },

    /// A JSON body failed a model validator
    #[error("malformed model: {0}")]
    MalformedModel(String),

    /// A WebSocket frame failed the codec
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A server-initiated comm_open named a target that cannot be resolved
    #[error("no comm target registered or resolvable for '{0}'")]
    CommTargetNotFound(String),

    /// An operation was attempted on a comm that is already closed
    #[error("the comm is closed")]
    CommClosed,

    /// The socket reconnection budget was exceeded
    #[error("websocket reconnection budget exhausted")]
    ReconnectExhausted,

    /// A REST call exceeded its configured timeout
    #[error("the request timed out")]
    Timeout,

    /// A session DELETE returned 410: the kernel died but the session record
    /// survived it
    #[error("the kernel was deleted, but the session was not")]
    KernelDeleted,

    /// A transport-level failure (connection refused, broken pipe, bad URL)
    #[error("network error: {0}")]
    NetworkError(String),
}

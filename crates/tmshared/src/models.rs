//
// models.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Models for the REST resources the server exposes.

use serde::{Deserialize, Serialize};

/// A running kernel, as reported by the kernels endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelModel {
    /// The server-assigned kernel ID
    pub id: String,

    /// The name of the kernel spec the kernel was started from
    pub name: String,
}

/// A session, as reported by the sessions endpoint. A session binds a logical
/// path (plus name and type) to a kernel instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionModel {
    /// The server-assigned session ID
    pub id: String,

    /// The path of the resource the session is attached to
    pub path: String,

    /// The display name of the session
    #[serde(default)]
    pub name: String,

    /// The type of the session (e.g. "notebook" or "console")
    #[serde(rename = "type", default)]
    pub session_type: String,

    /// The kernel bound to the session
    pub kernel: KernelModel,
}

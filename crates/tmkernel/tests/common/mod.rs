//
// mod.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//

#![allow(dead_code)]

pub mod mock_socket;
pub mod rest_server;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use tmkernel::kernel_connection::{ConnectOptions, KernelConnection, KernelStatus};
use tmkernel::rest::ServerSettings;
use tmshared::jupyter_message::{JupyterChannel, JupyterMessage, JupyterMessageHeader};
use tmshared::models::KernelModel;

use self::mock_socket::MockSocketFactory;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Settings that point nowhere; for tests that never touch REST.
pub fn offline_settings() -> ServerSettings {
    ServerSettings::new("http://127.0.0.1:1/").unwrap()
}

/// Connect options wired to a mock socket with test-friendly backoff.
pub fn test_connect_options(factory: &MockSocketFactory) -> ConnectOptions {
    ConnectOptions {
        socket_factory: Arc::new(factory.clone()),
        backoff_base: Duration::from_millis(2),
        ..Default::default()
    }
}

/// A fresh kernel model with a unique id (the engine registry is
/// process-wide, so tests must not share ids).
pub fn unique_kernel_model() -> KernelModel {
    KernelModel {
        id: format!("kernel-{}", Uuid::new_v4()),
        name: String::from("python3"),
    }
}

/// Attach an engine to a mock socket; returns the engine and the first
/// connection's handle, with the startup kernel_info_request already
/// consumed.
pub async fn connected_engine(
    factory: &MockSocketFactory,
    settings: ServerSettings,
) -> (
    KernelConnection,
    mock_socket::MockConnectionHandle,
    JupyterMessage,
) {
    let mut connection = factory.push_connection();
    let kernel =
        KernelConnection::connect_to(settings, unique_kernel_model(), test_connect_options(factory));
    let startup = connection.expect_outgoing().await;
    assert_eq!(startup.header.msg_type, "kernel_info_request");
    (kernel, connection, startup)
}

/// Build a server-side message, optionally parented to a request.
pub fn server_message(
    msg_type: &str,
    channel: JupyterChannel,
    parent_msg_id: Option<&str>,
    content: Value,
) -> JupyterMessage {
    JupyterMessage {
        header: JupyterMessageHeader {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.to_string(),
            username: String::from("kernel"),
            session: String::from("kernel-session"),
            version: String::from("5.3"),
            date: None,
        },
        parent_header: parent_msg_id.map(|msg_id| JupyterMessageHeader {
            msg_id: msg_id.to_string(),
            msg_type: String::from("request"),
            username: String::from("kernel"),
            session: String::from("kernel-session"),
            version: String::from("5.3"),
            date: None,
        }),
        channel,
        content,
        metadata: json!({}),
        buffers: vec![],
    }
}

/// An iopub status message.
pub fn status_message(parent_msg_id: Option<&str>, state: &str) -> JupyterMessage {
    server_message(
        "status",
        JupyterChannel::IOPub,
        parent_msg_id,
        json!({ "execution_state": state }),
    )
}

/// A shell reply message.
pub fn reply_message(msg_type: &str, parent_msg_id: &str, content: Value) -> JupyterMessage {
    server_message(msg_type, JupyterChannel::Shell, Some(parent_msg_id), content)
}

/// An iopub message parented to a request.
pub fn iopub_message(msg_type: &str, parent_msg_id: &str, content: Value) -> JupyterMessage {
    server_message(msg_type, JupyterChannel::IOPub, Some(parent_msg_id), content)
}

/// Wait for a specific status on a status subscription.
pub async fn wait_for_status(
    rx: &mut tokio::sync::broadcast::Receiver<KernelStatus>,
    expected: KernelStatus,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for status");
        let status = tokio::time::timeout(remaining, rx.recv())
            .await
            .expect("timed out waiting for status")
            .expect("status channel closed");
        if status == expected {
            return;
        }
    }
}

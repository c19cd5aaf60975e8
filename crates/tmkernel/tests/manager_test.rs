//
// manager_test.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//

//! Tests for the manager layer's cache coherency contract.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use common::mock_socket::MockSocketFactory;
use common::rest_server::MockServer;
use common::{init_logging, test_connect_options};
use tmkernel::kernel_manager::{KernelManager, ManagerOptions};
use tmkernel::session_manager::SessionManager;
use tmkernel::session::SessionChange;

fn slow_polls() -> ManagerOptions {
    // Tests drive refreshes by hand; the pollers stay out of the way
    ManagerOptions {
        running_poll_interval: Duration::from_secs(3600),
        specs_poll_interval: Duration::from_secs(3600),
    }
}

fn specs_body() -> Value {
    json!({
        "default": "python3",
        "kernelspecs": {
            "python3": {
                "name": "python3",
                "display_name": "Python 3",
                "language": "python",
                "argv": ["python", "-m", "ipykernel"],
                "env": {},
                "resources": {}
            }
        }
    })
}

/// The running cache changes only when a poll observes a real difference.
#[tokio::test]
async fn test_running_changed_fires_on_diff_only() {
    init_logging();
    let server = MockServer::start().await;
    let kernels: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let kernels = kernels.clone();
        server.route_with("GET", "api/kernels", move |_req| {
            (hyper::StatusCode::OK, Value::Array(kernels.lock().unwrap().clone()))
        });
    }
    server.route("GET", "api/kernelspecs", 200, specs_body());

    let manager = KernelManager::new(server.settings(), slow_polls());
    manager.ready().await;
    assert!(manager.running().is_empty());

    let mut changed = manager.running_changed();

    // Same (empty) list: no emission
    manager.refresh_running().await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(100), changed.recv())
            .await
            .is_err()
    );

    // A kernel appears: one emission
    kernels
        .lock()
        .unwrap()
        .push(json!({ "id": "k-1", "name": "python3" }));
    manager.refresh_running().await.unwrap();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), changed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, "k-1");

    // Unchanged list again: silence
    manager.refresh_running().await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(100), changed.recv())
            .await
            .is_err()
    );
}

/// Duplicate ids in the server's list collapse to one entry.
#[tokio::test]
async fn test_running_list_dedupes_by_id() {
    init_logging();
    let server = MockServer::start().await;
    server.route(
        "GET",
        "api/kernels",
        200,
        json!([
            { "id": "k-dup", "name": "python3" },
            { "id": "k-dup", "name": "python3" },
            { "id": "k-other", "name": "python3" },
        ]),
    );
    server.route("GET", "api/kernelspecs", 200, specs_body());

    let manager = KernelManager::new(server.settings(), slow_polls());
    manager.ready().await;

    let running = manager.running();
    assert_eq!(running.len(), 2);
}

/// A specs payload whose default is not among the specs is rejected and
/// leaves the cache untouched.
#[tokio::test]
async fn test_invalid_specs_rejected() {
    init_logging();
    let server = MockServer::start().await;
    server.route("GET", "api/kernels", 200, json!([]));
    server.route(
        "GET",
        "api/kernelspecs",
        200,
        json!({ "default": "ghost", "kernelspecs": {} }),
    );

    let manager = KernelManager::new(server.settings(), slow_polls());
    manager.ready().await;
    assert!(manager.specs().is_none());

    let result = manager.refresh_specs().await;
    assert!(matches!(
        result,
        Err(tmkernel::error::ClientError::MalformedModel(_))
    ));
}

/// Specs changes emit once per actual change.
#[tokio::test]
async fn test_specs_changed_fires_on_diff_only() {
    init_logging();
    let server = MockServer::start().await;
    server.route("GET", "api/kernels", 200, json!([]));
    let specs: Arc<Mutex<Value>> = Arc::new(Mutex::new(specs_body()));
    {
        let specs = specs.clone();
        server.route_with("GET", "api/kernelspecs", move |_req| {
            (hyper::StatusCode::OK, specs.lock().unwrap().clone())
        });
    }

    let manager = KernelManager::new(server.settings(), slow_polls());
    manager.ready().await;
    assert!(manager.specs().is_some());

    let mut changed = manager.specs_changed();
    manager.refresh_specs().await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(100), changed.recv())
            .await
            .is_err()
    );

    specs.lock().unwrap()["kernelspecs"]["python3"]["display_name"] = json!("Python 3 (renamed)");
    manager.refresh_specs().await.unwrap();
    let bundle = tokio::time::timeout(Duration::from_secs(5), changed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        bundle.kernelspecs["python3"].display_name,
        "Python 3 (renamed)"
    );
}

/// Manager shutdown removes the kernel from the cache optimistically.
#[tokio::test]
async fn test_manager_shutdown_is_optimistic() {
    init_logging();
    let server = MockServer::start().await;
    let kernel_id = format!("k-{}", Uuid::new_v4());
    server.route(
        "GET",
        "api/kernels",
        200,
        json!([{ "id": kernel_id, "name": "python3" }]),
    );
    server.route("GET", "api/kernelspecs", 200, specs_body());
    server.route(
        "DELETE",
        &format!("api/kernels/{}", kernel_id),
        204,
        json!({}),
    );

    let manager = KernelManager::new(server.settings(), slow_polls());
    manager.ready().await;
    assert_eq!(manager.running().len(), 1);

    let mut changed = manager.running_changed();
    manager.shutdown(&kernel_id).await.unwrap();

    // The cache dropped the id without waiting for a poll
    assert!(manager.running().is_empty());
    let snapshot = tokio::time::timeout(Duration::from_secs(5), changed.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(snapshot.is_empty());
}

/// The interval pollers pick up fleet changes on their own.
#[tokio::test]
async fn test_poller_observes_changes() {
    init_logging();
    let server = MockServer::start().await;
    let kernels: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let kernels = kernels.clone();
        server.route_with("GET", "api/kernels", move |_req| {
            (hyper::StatusCode::OK, Value::Array(kernels.lock().unwrap().clone()))
        });
    }
    server.route("GET", "api/kernelspecs", 200, specs_body());

    let manager = KernelManager::new(
        server.settings(),
        ManagerOptions {
            running_poll_interval: Duration::from_millis(25),
            specs_poll_interval: Duration::from_secs(3600),
        },
    );
    manager.ready().await;

    let mut changed = manager.running_changed();
    kernels
        .lock()
        .unwrap()
        .push(json!({ "id": "k-polled", "name": "python3" }));

    let snapshot = tokio::time::timeout(Duration::from_secs(5), changed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot[0].id, "k-polled");
}

/// Session polls reconcile connected coordinators instead of duplicating
/// them.
#[tokio::test]
async fn test_session_manager_reconciles_connected_sessions() {
    init_logging();
    let server = MockServer::start().await;
    let factory = MockSocketFactory::new();
    let session_id = format!("s-{}", Uuid::new_v4());
    let kernel_id = format!("k-{}", Uuid::new_v4());

    let sessions: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let sessions = sessions.clone();
        server.route_with("GET", "api/sessions", move |_req| {
            (hyper::StatusCode::OK, Value::Array(sessions.lock().unwrap().clone()))
        });
    }
    server.route("GET", "api/kernelspecs", 200, specs_body());
    {
        let session_id = session_id.clone();
        let kernel_id = kernel_id.clone();
        let sessions = sessions.clone();
        server.route_with("POST", "api/sessions", move |_req| {
            let model = json!({
                "id": session_id,
                "path": "nb.ipynb",
                "name": "untitled",
                "type": "notebook",
                "kernel": { "id": kernel_id, "name": "python3" },
            });
            sessions.lock().unwrap().push(model.clone());
            (hyper::StatusCode::CREATED, model)
        });
    }

    let manager = SessionManager::with_connect_options(
        server.settings(),
        slow_polls(),
        test_connect_options(&factory),
    );
    manager.ready().await;

    let session = manager
        .start_new(tmkernel::session::SessionOptions {
            path: String::from("nb.ipynb"),
            name: String::from("untitled"),
            session_type: String::from("notebook"),
            default_kernel_name: Some(String::from("python3")),
        })
        .await
        .unwrap();
    assert_eq!(session.id().as_deref(), Some(session_id.as_str()));
    assert_eq!(manager.find_by_path("nb.ipynb").unwrap().id, session_id);

    // The server renames the session; the next poll must update the
    // connected coordinator in place
    let mut changed = session.changed();
    sessions.lock().unwrap()[0]["path"] = json!("renamed.ipynb");
    manager.refresh_running().await.unwrap();

    assert_eq!(
        tokio::time::timeout(Duration::from_secs(5), changed.recv())
            .await
            .unwrap()
            .unwrap(),
        SessionChange::Path
    );
    assert_eq!(session.path(), "renamed.ipynb");

    // connect_to for the same id reuses the coordinator
    let model = manager.find_by_id(&session_id).unwrap();
    let again = manager.connect_to(model);
    assert_eq!(again.path(), session.path());
}

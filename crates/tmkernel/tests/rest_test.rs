//
// rest_test.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//

//! Tests for the REST plumbing: authentication headers, status mapping, and
//! timeouts.

mod common;

use std::time::Duration;

use serde_json::json;

use common::rest_server::MockServer;
use common::init_logging;
use tmkernel::error::ClientError;
use tmkernel::rest;

#[tokio::test]
async fn test_token_header() {
    init_logging();
    let server = MockServer::start().await;
    server.route("GET", "api/kernels", 200, json!([]));

    let settings = server.settings().with_token("sekrit");
    rest::list_running_kernels(&settings).await.unwrap();

    let request = &server.requests()[0];
    assert_eq!(
        request.headers.get("authorization").map(String::as_str),
        Some("token sekrit")
    );
    assert!(!request.headers.contains_key("x-xsrftoken"));
}

#[tokio::test]
async fn test_xsrf_header_without_token() {
    init_logging();
    let server = MockServer::start().await;
    server.route("GET", "api/kernels", 200, json!([]));

    let settings = server.settings().with_xsrf_token("xsrf-cookie");
    rest::list_running_kernels(&settings).await.unwrap();

    let request = &server.requests()[0];
    assert_eq!(
        request.headers.get("x-xsrftoken").map(String::as_str),
        Some("xsrf-cookie")
    );
    assert!(!request.headers.contains_key("authorization"));
}

#[tokio::test]
async fn test_token_wins_over_xsrf() {
    init_logging();
    let server = MockServer::start().await;
    server.route("GET", "api/kernels", 200, json!([]));

    let settings = server
        .settings()
        .with_token("sekrit")
        .with_xsrf_token("xsrf-cookie");
    rest::list_running_kernels(&settings).await.unwrap();

    let request = &server.requests()[0];
    assert!(request.headers.contains_key("authorization"));
    assert!(!request.headers.contains_key("x-xsrftoken"));
}

#[tokio::test]
async fn test_post_bodies_are_json() {
    init_logging();
    let server = MockServer::start().await;
    server.route(
        "POST",
        "api/kernels",
        201,
        json!({ "id": "k-1", "name": "python3" }),
    );

    let model = rest::start_kernel(&server.settings(), "python3").await.unwrap();
    assert_eq!(model.id, "k-1");

    let request = &server.requests()[0];
    assert_eq!(
        request.headers.get("content-type").map(String::as_str),
        Some("application/json")
    );
    assert_eq!(request.body.as_ref().unwrap()["name"], "python3");
}

#[tokio::test]
async fn test_unexpected_status_maps_to_invalid_response() {
    init_logging();
    let server = MockServer::start().await;
    server.route("GET", "api/kernels", 503, json!({ "message": "down" }));

    let err = rest::list_running_kernels(&server.settings())
        .await
        .unwrap_err();
    match err {
        ClientError::InvalidResponse { status, body } => {
            assert_eq!(status, 503);
            assert!(body.contains("down"));
        }
        other => panic!("expected InvalidResponse, got {:?}", other),
    }
}

#[tokio::test]
async fn test_undecodable_body_maps_to_malformed_model() {
    init_logging();
    let server = MockServer::start().await;
    // Wrong shape: a list where a model object is expected
    server.route("GET", "api/kernels/k-1", 200, json!(["nope"]));

    let err = rest::get_kernel_model(&server.settings(), "k-1")
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::MalformedModel(_)));
}

#[tokio::test]
async fn test_request_timeout() {
    init_logging();
    let server = MockServer::start().await;
    server.route_delayed(
        "GET",
        "api/kernels",
        Duration::from_secs(5),
        200,
        json!([]),
    );

    let settings = server
        .settings()
        .with_request_timeout(Some(Duration::from_millis(50)));
    let err = rest::list_running_kernels(&settings).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout));
}

#[tokio::test]
async fn test_kernel_delete_missing_is_success() {
    init_logging();
    let server = MockServer::start().await;
    server.route(
        "DELETE",
        "api/kernels/gone",
        404,
        json!({ "message": "no such kernel" }),
    );

    rest::shutdown_kernel(&server.settings(), "gone")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_path_segments_are_percent_encoded() {
    init_logging();
    let server = MockServer::start().await;
    server.route(
        "GET",
        "api/kernels/odd%20id",
        200,
        json!({ "id": "odd id", "name": "python3" }),
    );

    let model = rest::get_kernel_model(&server.settings(), "odd id")
        .await
        .unwrap();
    assert_eq!(model.id, "odd id");
}

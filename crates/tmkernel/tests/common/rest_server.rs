//
// rest_server.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//

//! A small scriptable HTTP server backing the REST side of the tests.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde_json::Value;
use tokio::task::JoinHandle;

use tmkernel::rest::ServerSettings;

type Responder = Box<dyn Fn(Option<Value>) -> (StatusCode, Value) + Send + Sync>;

struct Route {
    responder: Responder,
    delay: Option<Duration>,
}

/// One request the server saw.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
    pub headers: HashMap<String, String>,
}

struct ServerState {
    routes: Mutex<HashMap<(String, String), Route>>,
    requests: Mutex<Vec<RecordedRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A scriptable mock Jupyter REST server.
pub struct MockServer {
    state: Arc<ServerState>,
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState {
            routes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });

        let service_state = state.clone();
        let make_service = make_service_fn(move |_conn| {
            let state = service_state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| handle(state.clone(), request)))
            }
        });

        let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_service);
        let addr = server.local_addr();
        let task = tokio::spawn(async move {
            let _ = server.await;
        });

        Self { state, addr, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn settings(&self) -> ServerSettings {
        ServerSettings::new(&self.url()).expect("mock server URL should be valid")
    }

    /// Script a canned response.
    pub fn route(&self, method: &str, path: &str, status: u16, body: Value) {
        self.route_with(method, path, move |_req| {
            (StatusCode::from_u16(status).unwrap(), body.clone())
        });
    }

    /// Script a computed response.
    pub fn route_with(
        &self,
        method: &str,
        path: &str,
        responder: impl Fn(Option<Value>) -> (StatusCode, Value) + Send + Sync + 'static,
    ) {
        self.state.routes.lock().unwrap().insert(
            (method.to_string(), path.to_string()),
            Route {
                responder: Box::new(responder),
                delay: None,
            },
        );
    }

    /// Script a canned response that is held for `delay` before returning.
    pub fn route_delayed(&self, method: &str, path: &str, delay: Duration, status: u16, body: Value) {
        self.state.routes.lock().unwrap().insert(
            (method.to_string(), path.to_string()),
            Route {
                responder: Box::new(move |_req| {
                    (StatusCode::from_u16(status).unwrap(), body.clone())
                }),
                delay: Some(delay),
            },
        );
    }

    /// Every request the server has seen.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// How many requests hit the given route.
    pub fn request_count(&self, method: &str, path: &str) -> usize {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.method == method && request.path == path)
            .count()
    }

    /// The largest number of requests that were in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle(
    state: Arc<ServerState>,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = request.method().to_string();
    let path = request
        .uri()
        .path()
        .trim_start_matches('/')
        .to_string();
    let headers: HashMap<String, String> = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_lowercase(), value.to_string()))
        })
        .collect();

    let bytes = hyper::body::to_bytes(request.into_body())
        .await
        .unwrap_or_default();
    let body: Option<Value> = if bytes.is_empty() {
        None
    } else {
        serde_json::from_slice(&bytes).ok()
    };

    state.requests.lock().unwrap().push(RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        body: body.clone(),
        headers,
    });

    let current = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_in_flight.fetch_max(current, Ordering::SeqCst);

    let scripted = {
        let routes = state.routes.lock().unwrap();
        routes
            .get(&(method, path))
            .map(|route| ((route.responder)(body), route.delay))
    };

    let response = match scripted {
        Some(((status, value), delay)) => {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Response::builder()
                .status(status)
                .header("Content-Type", "application/json")
                .body(Body::from(value.to_string()))
                .unwrap()
        }
        None => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found"))
            .unwrap(),
    };

    state.in_flight.fetch_sub(1, Ordering::SeqCst);
    Ok(response)
}

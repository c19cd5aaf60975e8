//
// rest.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! The REST half of the client: server settings plus typed calls for the
//! kernel, session, and kernel spec endpoints.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Body, Client, Method, Request, StatusCode, Uri};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::de::DeserializeOwned;
use serde_json::Value;

use tmshared::kernel_spec::SpecsBundle;
use tmshared::models::{KernelModel, SessionModel};

use crate::error::ClientError;

/// The percent-encode set for path segments (ids and the like).
const PATH_SEGMENT_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

/// Percent-encode one path segment.
pub(crate) fn encode_path_segment(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT_ENCODE_SET).to_string()
}

/// Connection settings for a Jupyter server.
///
/// Carries the base URL (and the WebSocket URL derived from it), the
/// authentication material, the default username stamped on outgoing message
/// headers, and an optional per-request timeout. Cloning is cheap; the
/// underlying HTTP client is shared.
#[derive(Clone)]
pub struct ServerSettings {
    base_url: String,
    ws_url: String,
    token: Option<String>,
    xsrf_token: Option<String>,
    username: String,
    request_timeout: Option<Duration>,
    client: Client<HttpConnector, Body>,
}

impl fmt::Debug for ServerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSettings")
            .field("base_url", &self.base_url)
            .field("ws_url", &self.ws_url)
            .field("username", &self.username)
            .finish()
    }
}

impl ServerSettings {
    /// Create settings for the server at the given base URL. The WebSocket
    /// URL is derived by swapping the scheme (`http` → `ws`, `https` → `wss`).
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let parsed = url::Url::parse(base_url)
            .map_err(|err| ClientError::NetworkError(format!("invalid base URL: {}", err)))?;
        let ws_scheme = match parsed.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(ClientError::NetworkError(format!(
                    "unsupported URL scheme '{}'",
                    other
                )))
            }
        };

        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let ws_url = format!(
            "{}{}",
            ws_scheme,
            base_url.trim_start_matches(parsed.scheme())
        );

        Ok(Self {
            base_url,
            ws_url,
            token: None,
            xsrf_token: None,
            username: String::from("client"),
            request_timeout: None,
            client: Client::new(),
        })
    }

    /// Use a bearer token for authentication.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Use an XSRF token (sent only when no bearer token is configured).
    pub fn with_xsrf_token(mut self, token: impl Into<String>) -> Self {
        self.xsrf_token = Some(token.into());
        self
    }

    /// Set the username stamped on outgoing message headers.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Set a per-request timeout; `None` (the default) or a zero duration
    /// means no timeout.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The base URL, always with a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The WebSocket URL, always with a trailing slash.
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// The default username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The URL of the channels WebSocket for a kernel.
    pub(crate) fn ws_channels_url(&self, kernel_id: &str, client_id: &str) -> String {
        format!(
            "{}api/kernels/{}/channels?session_id={}",
            self.ws_url,
            encode_path_segment(kernel_id),
            encode_path_segment(client_id)
        )
    }

    /// Issue one request and collect the response body.
    pub(crate) async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Bytes), ClientError> {
        let uri: Uri = format!("{}{}", self.base_url, path)
            .parse()
            .map_err(|err| ClientError::NetworkError(format!("invalid request URL: {}", err)))?;

        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("token {}", token));
        } else if let Some(xsrf) = &self.xsrf_token {
            builder = builder.header("X-XSRFToken", xsrf.as_str());
        }

        let request = match body {
            Some(value) => {
                let bytes = serde_json::to_vec(&value)
                    .map_err(|err| ClientError::MalformedModel(err.to_string()))?;
                builder
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(bytes))
            }
            None => builder.body(Body::empty()),
        }
        .map_err(|err| ClientError::NetworkError(err.to_string()))?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|err| ClientError::NetworkError(err.to_string()))?;
            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body())
                .await
                .map_err(|err| ClientError::NetworkError(err.to_string()))?;
            Ok((status, bytes))
        };

        match self.request_timeout {
            Some(timeout) if !timeout.is_zero() => tokio::time::timeout(timeout, exchange)
                .await
                .map_err(|_| ClientError::Timeout)?,
            _ => exchange.await,
        }
    }
}

fn invalid_response(status: StatusCode, bytes: &Bytes) -> ClientError {
    ClientError::InvalidResponse {
        status: status.as_u16(),
        body: String::from_utf8_lossy(bytes).to_string(),
    }
}

fn expect_json<T: DeserializeOwned>(
    status: StatusCode,
    bytes: Bytes,
    expected: StatusCode,
) -> Result<T, ClientError> {
    if status != expected {
        return Err(invalid_response(status, &bytes));
    }
    serde_json::from_slice(&bytes).map_err(|err| ClientError::MalformedModel(err.to_string()))
}

fn expect_empty(status: StatusCode, bytes: Bytes, expected: StatusCode) -> Result<(), ClientError> {
    if status != expected {
        return Err(invalid_response(status, &bytes));
    }
    Ok(())
}

/// Fetch the kernel spec bundle.
pub async fn list_kernel_specs(settings: &ServerSettings) -> Result<SpecsBundle, ClientError> {
    let (status, bytes) = settings
        .request(Method::GET, "api/kernelspecs", None)
        .await?;
    let bundle: SpecsBundle = expect_json(status, bytes, StatusCode::OK)?;
    bundle.validate().map_err(ClientError::MalformedModel)?;
    Ok(bundle)
}

/// List the running kernels.
pub async fn list_running_kernels(
    settings: &ServerSettings,
) -> Result<Vec<KernelModel>, ClientError> {
    let (status, bytes) = settings.request(Method::GET, "api/kernels", None).await?;
    expect_json(status, bytes, StatusCode::OK)
}

/// Start a new kernel from the named spec.
pub async fn start_kernel(
    settings: &ServerSettings,
    name: &str,
) -> Result<KernelModel, ClientError> {
    let (status, bytes) = settings
        .request(
            Method::POST,
            "api/kernels",
            Some(serde_json::json!({ "name": name })),
        )
        .await?;
    expect_json(status, bytes, StatusCode::CREATED)
}

/// Fetch the model for a running kernel.
pub async fn get_kernel_model(
    settings: &ServerSettings,
    id: &str,
) -> Result<KernelModel, ClientError> {
    let path = format!("api/kernels/{}", encode_path_segment(id));
    let (status, bytes) = settings.request(Method::GET, &path, None).await?;
    expect_json(status, bytes, StatusCode::OK)
}

/// Interrupt a kernel.
pub async fn interrupt_kernel(settings: &ServerSettings, id: &str) -> Result<(), ClientError> {
    let path = format!("api/kernels/{}/interrupt", encode_path_segment(id));
    let (status, bytes) = settings.request(Method::POST, &path, None).await?;
    expect_empty(status, bytes, StatusCode::NO_CONTENT)
}

/// Restart a kernel.
pub async fn restart_kernel(
    settings: &ServerSettings,
    id: &str,
) -> Result<KernelModel, ClientError> {
    let path = format!("api/kernels/{}/restart", encode_path_segment(id));
    let (status, bytes) = settings.request(Method::POST, &path, None).await?;
    expect_json(status, bytes, StatusCode::OK)
}

/// Shut down a kernel. A 404 is treated as success: the kernel is already
/// gone, which is what we asked for.
pub async fn shutdown_kernel(settings: &ServerSettings, id: &str) -> Result<(), ClientError> {
    let path = format!("api/kernels/{}", encode_path_segment(id));
    let (status, bytes) = settings.request(Method::DELETE, &path, None).await?;
    if status == StatusCode::NOT_FOUND {
        log::warn!("kernel {} was not found when deleting it; ignoring", id);
        return Ok(());
    }
    expect_empty(status, bytes, StatusCode::NO_CONTENT)
}

/// List the running sessions.
pub async fn list_running_sessions(
    settings: &ServerSettings,
) -> Result<Vec<SessionModel>, ClientError> {
    let (status, bytes) = settings.request(Method::GET, "api/sessions", None).await?;
    expect_json(status, bytes, StatusCode::OK)
}

/// Create a new session.
pub async fn start_session(
    settings: &ServerSettings,
    body: Value,
) -> Result<SessionModel, ClientError> {
    let (status, bytes) = settings
        .request(Method::POST, "api/sessions", Some(body))
        .await?;
    expect_json(status, bytes, StatusCode::CREATED)
}

/// Fetch the model for a session.
pub async fn get_session_model(
    settings: &ServerSettings,
    id: &str,
) -> Result<SessionModel, ClientError> {
    let path = format!("api/sessions/{}", encode_path_segment(id));
    let (status, bytes) = settings.request(Method::GET, &path, None).await?;
    expect_json(status, bytes, StatusCode::OK)
}

/// Patch a session with a partial model and return the reconciled model.
pub async fn update_session(
    settings: &ServerSettings,
    id: &str,
    patch: Value,
) -> Result<SessionModel, ClientError> {
    let path = format!("api/sessions/{}", encode_path_segment(id));
    let (status, bytes) = settings.request(Method::PATCH, &path, Some(patch)).await?;
    expect_json(status, bytes, StatusCode::OK)
}

/// Delete a session. A 404 is treated as success with a warning; a 410 means
/// the kernel was deleted out from under the session.
pub async fn shutdown_session(settings: &ServerSettings, id: &str) -> Result<(), ClientError> {
    let path = format!("api/sessions/{}", encode_path_segment(id));
    let (status, bytes) = settings.request(Method::DELETE, &path, None).await?;
    if status == StatusCode::NOT_FOUND {
        log::warn!("session {} was not found when deleting it; ignoring", id);
        return Ok(());
    }
    if status == StatusCode::GONE {
        return Err(ClientError::KernelDeleted);
    }
    expect_empty(status, bytes, StatusCode::NO_CONTENT)
}

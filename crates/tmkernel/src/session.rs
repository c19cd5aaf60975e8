//
// session.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! The session coordinator: couples one kernel channel engine to a
//! server-side session (a binding of a logical path, name, and type to a
//! kernel instance), and keeps the two reconciled across renames, kernel
//! switches, and server-driven updates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use event_listener::Event;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use tmshared::models::SessionModel;

use crate::error::ClientError;
use crate::kernel_connection::{ConnectOptions, KernelConnection};
use crate::rest::{self, ServerSettings};

/// The session fields a `changed` signal can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionChange {
    Kernel,
    Path,
    Name,
    Type,
}

/// Options for creating a session coordinator.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// The path of the resource the session is attached to
    pub path: String,

    /// The display name of the session
    pub name: String,

    /// The type of the session (e.g. "notebook" or "console")
    pub session_type: String,

    /// The kernel spec to start when none is named explicitly
    pub default_kernel_name: Option<String>,
}

struct SessionState {
    id: Option<String>,
    path: String,
    name: String,
    session_type: String,
    kernel: Option<KernelConnection>,
}

struct SessionInner {
    settings: ServerSettings,
    connect_options: ConnectOptions,
    default_kernel_name: Option<String>,
    state: Mutex<SessionState>,
    /// Serializes PATCHes so at most one is in flight per session
    patch_guard: tokio::sync::Mutex<()>,
    /// Suppresses reentrant updates while a PATCH is outstanding
    updating: AtomicBool,
    changed_tx: broadcast::Sender<SessionChange>,
    terminated: Event,
    terminated_flag: AtomicBool,
}

/// A session coordinator. Cloning is cheap; all clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a local session coordinator. Nothing is sent to the server
    /// until [`Session::start_kernel`] is called.
    pub fn new(
        settings: ServerSettings,
        options: SessionOptions,
        connect_options: ConnectOptions,
    ) -> Self {
        let (changed_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(SessionInner {
                settings,
                connect_options,
                default_kernel_name: options.default_kernel_name,
                state: Mutex::new(SessionState {
                    id: None,
                    path: options.path,
                    name: options.name,
                    session_type: options.session_type,
                    kernel: None,
                }),
                patch_guard: tokio::sync::Mutex::new(()),
                updating: AtomicBool::new(false),
                changed_tx,
                terminated: Event::new(),
                terminated_flag: AtomicBool::new(false),
            }),
        }
    }

    /// Attach a coordinator to an existing server-side session.
    pub fn from_model(
        settings: ServerSettings,
        model: SessionModel,
        connect_options: ConnectOptions,
    ) -> Self {
        let session = Self::new(
            settings,
            SessionOptions {
                path: model.path.clone(),
                name: model.name.clone(),
                session_type: model.session_type.clone(),
                default_kernel_name: Some(model.kernel.name.clone()),
            },
            connect_options,
        );
        session.apply_model(model);
        session
    }

    /// The server-side session ID, if the session has been started.
    pub fn id(&self) -> Option<String> {
        self.inner.state.lock().unwrap().id.clone()
    }

    /// The session's path.
    pub fn path(&self) -> String {
        self.inner.state.lock().unwrap().path.clone()
    }

    /// The session's display name.
    pub fn name(&self) -> String {
        self.inner.state.lock().unwrap().name.clone()
    }

    /// The session's type.
    pub fn session_type(&self) -> String {
        self.inner.state.lock().unwrap().session_type.clone()
    }

    /// The channel engine of the session's kernel, if one is attached.
    pub fn kernel(&self) -> Option<KernelConnection> {
        self.inner.state.lock().unwrap().kernel.clone()
    }

    /// Subscribe to field changes.
    pub fn changed(&self) -> broadcast::Receiver<SessionChange> {
        self.inner.changed_tx.subscribe()
    }

    /// Whether the session has been shut down.
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated_flag.load(Ordering::SeqCst)
    }

    /// Wait for the session to be shut down.
    pub async fn terminated(&self) {
        loop {
            let listener = self.inner.terminated.listen();
            if self.is_terminated() {
                return;
            }
            listener.await;
        }
    }

    /// Start (or switch) the session's kernel. Creates the server-side
    /// session on first use; PATCHes it afterwards. The previous engine, if
    /// any, is disposed.
    pub async fn start_kernel(
        &self,
        kernel_name: Option<&str>,
    ) -> Result<KernelConnection, ClientError> {
        let old = self.inner.state.lock().unwrap().kernel.take();
        if let Some(old) = old {
            old.dispose();
        }

        let name = kernel_name
            .map(str::to_string)
            .or_else(|| self.inner.default_kernel_name.clone())
            .ok_or_else(|| {
                ClientError::MalformedModel(String::from(
                    "no kernel name given and the session has no default",
                ))
            })?;

        let id = self.inner.state.lock().unwrap().id.clone();
        let model = match id {
            None => {
                let body = {
                    let state = self.inner.state.lock().unwrap();
                    json!({
                        "path": state.path,
                        "name": state.name,
                        "type": state.session_type,
                        "kernel": { "name": name },
                    })
                };
                rest::start_session(&self.inner.settings, body).await?
            }
            Some(id) => {
                let _guard = self.inner.patch_guard.lock().await;
                self.inner.updating.store(true, Ordering::SeqCst);
                let result = rest::update_session(
                    &self.inner.settings,
                    &id,
                    json!({ "kernel": { "name": name } }),
                )
                .await;
                self.inner.updating.store(false, Ordering::SeqCst);
                result?
            }
        };

        self.apply_model(model);
        self.kernel().ok_or(ClientError::KernelTerminated)
    }

    /// Rename the session's path.
    pub async fn set_path(&self, path: &str) -> Result<(), ClientError> {
        self.set_field(SessionChange::Path, path.to_string()).await
    }

    /// Rename the session.
    pub async fn set_name(&self, name: &str) -> Result<(), ClientError> {
        self.set_field(SessionChange::Name, name.to_string()).await
    }

    /// Change the session's type.
    pub async fn set_type(&self, session_type: &str) -> Result<(), ClientError> {
        self.set_field(SessionChange::Type, session_type.to_string())
            .await
    }

    async fn set_field(&self, change: SessionChange, value: String) -> Result<(), ClientError> {
        // Apply locally first; a failed PATCH rolls this back
        let id = {
            let mut state = self.inner.state.lock().unwrap();
            let slot = match change {
                SessionChange::Path => &mut state.path,
                SessionChange::Name => &mut state.name,
                SessionChange::Type => &mut state.session_type,
                SessionChange::Kernel => unreachable!("kernel changes go through start_kernel"),
            };
            if *slot == value {
                return Ok(());
            }
            let previous = std::mem::replace(slot, value.clone());
            (state.id.clone(), previous)
        };
        let (session_id, previous) = id;
        let _ = self.inner.changed_tx.send(change);

        let Some(session_id) = session_id else {
            // Not started yet; the change is local-only
            return Ok(());
        };

        let field = match change {
            SessionChange::Path => "path",
            SessionChange::Name => "name",
            SessionChange::Type => "type",
            SessionChange::Kernel => unreachable!(),
        };

        let mut patch = serde_json::Map::new();
        patch.insert(field.to_string(), Value::String(value.clone()));

        let _guard = self.inner.patch_guard.lock().await;
        self.inner.updating.store(true, Ordering::SeqCst);
        let result =
            rest::update_session(&self.inner.settings, &session_id, Value::Object(patch)).await;
        self.inner.updating.store(false, Ordering::SeqCst);

        match result {
            Ok(model) => {
                self.apply_model(model);
                Ok(())
            }
            Err(err) => {
                // Roll back, unless someone else changed the field again in
                // the meantime
                {
                    let mut state = self.inner.state.lock().unwrap();
                    let slot = match change {
                        SessionChange::Path => &mut state.path,
                        SessionChange::Name => &mut state.name,
                        SessionChange::Type => &mut state.session_type,
                        SessionChange::Kernel => unreachable!(),
                    };
                    if *slot == value {
                        *slot = previous;
                    }
                }
                let _ = self.inner.changed_tx.send(change);
                log::warn!(
                    "[session {}] failed to update {}: {}",
                    session_id,
                    field,
                    err
                );
                Err(err)
            }
        }
    }

    /// Reconcile from a server model. Suppressed while a PATCH issued by
    /// this coordinator is outstanding, so poll-driven updates cannot race
    /// the PATCH's own reconciliation.
    pub fn update(&self, model: SessionModel) {
        if self.inner.updating.load(Ordering::SeqCst) {
            return;
        }
        self.apply_model(model);
    }

    fn apply_model(&self, model: SessionModel) {
        let mut changes: Vec<SessionChange> = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.id = Some(model.id.clone());

            let kernel_differs = match &state.kernel {
                Some(kernel) => kernel.id() != model.kernel.id,
                None => true,
            };
            if kernel_differs {
                if let Some(old) = state.kernel.take() {
                    old.dispose();
                }
                let engine = KernelConnection::connect_to(
                    self.inner.settings.clone(),
                    model.kernel.clone(),
                    self.inner.connect_options.clone(),
                );
                state.kernel = Some(engine);
                changes.push(SessionChange::Kernel);
            }
            if state.path != model.path {
                state.path = model.path.clone();
                changes.push(SessionChange::Path);
            }
            if state.name != model.name {
                state.name = model.name.clone();
                changes.push(SessionChange::Name);
            }
            if state.session_type != model.session_type {
                state.session_type = model.session_type.clone();
                changes.push(SessionChange::Type);
            }
        }
        for change in changes {
            let _ = self.inner.changed_tx.send(change);
        }
    }

    /// Shut the session down. The id is nulled first so concurrent PATCHes
    /// short-circuit; a second shutdown is a no-op.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let id = self.inner.state.lock().unwrap().id.take();
        let Some(id) = id else {
            return Ok(());
        };

        let result = rest::shutdown_session(&self.inner.settings, &id).await;

        let kernel = self.inner.state.lock().unwrap().kernel.take();
        if let Some(kernel) = kernel {
            kernel.dispose();
        }
        self.inner.terminated_flag.store(true, Ordering::SeqCst);
        self.inner.terminated.notify(usize::MAX);
        log::info!("[session {}] terminated", id);

        result
    }
}

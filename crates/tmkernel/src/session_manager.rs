//
// session_manager.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Fleet view of the server's sessions. Mirrors the kernel manager's cache
//! discipline and additionally keeps connected [`Session`] coordinators
//! reconciled with what each poll observes, so polls never create duplicate
//! client-side state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use event_listener::Event;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use tmshared::kernel_spec::SpecsBundle;
use tmshared::models::SessionModel;

use crate::error::ClientError;
use crate::kernel_connection::ConnectOptions;
use crate::kernel_manager::ManagerOptions;
use crate::rest::{self, ServerSettings};
use crate::session::{Session, SessionOptions};

struct SessionManagerInner {
    settings: ServerSettings,
    connect_options: ConnectOptions,
    running: Mutex<Vec<SessionModel>>,
    specs: Mutex<Option<SpecsBundle>>,
    /// Connected coordinators, keyed by session id
    connected: Mutex<HashMap<String, Session>>,
    running_changed: broadcast::Sender<Vec<SessionModel>>,
    specs_changed: broadcast::Sender<SpecsBundle>,
    ready_flag: AtomicBool,
    ready_event: Event,
}

impl SessionManagerInner {
    async fn refresh_running(&self) -> Result<(), ClientError> {
        let listed = rest::list_running_sessions(&self.settings).await?;

        // De-duplicate by id, preserving order
        let mut seen = std::collections::HashSet::new();
        let mut snapshot: Vec<SessionModel> = Vec::with_capacity(listed.len());
        for model in listed {
            if seen.insert(model.id.clone()) {
                snapshot.push(model);
            }
        }
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));

        // Reconcile connected coordinators before emitting, so listeners
        // observe consistent state
        {
            let connected = self.connected.lock().unwrap();
            for model in &snapshot {
                if let Some(session) = connected.get(&model.id) {
                    session.update(model.clone());
                }
            }
        }

        let changed = {
            let mut running = self.running.lock().unwrap();
            if *running == snapshot {
                false
            } else {
                *running = snapshot.clone();
                true
            }
        };
        if changed {
            log::debug!("running session list changed ({} sessions)", snapshot.len());
            let _ = self.running_changed.send(snapshot);
        }
        Ok(())
    }

    async fn refresh_specs(&self) -> Result<(), ClientError> {
        let bundle = rest::list_kernel_specs(&self.settings).await?;
        let changed = {
            let mut specs = self.specs.lock().unwrap();
            if specs.as_ref() == Some(&bundle) {
                false
            } else {
                *specs = Some(bundle.clone());
                true
            }
        };
        if changed {
            let _ = self.specs_changed.send(bundle);
        }
        Ok(())
    }
}

/// Tracks the server's sessions. Dropping the manager stops its poll tasks.
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionManager {
    pub fn new(settings: ServerSettings, options: ManagerOptions) -> Self {
        Self::with_connect_options(settings, options, ConnectOptions::default())
    }

    /// Create a manager whose sessions attach kernels with the given options.
    pub fn with_connect_options(
        settings: ServerSettings,
        options: ManagerOptions,
        connect_options: ConnectOptions,
    ) -> Self {
        let (running_changed, _) = broadcast::channel(64);
        let (specs_changed, _) = broadcast::channel(64);
        let inner = Arc::new(SessionManagerInner {
            settings,
            connect_options,
            running: Mutex::new(Vec::new()),
            specs: Mutex::new(None),
            connected: Mutex::new(HashMap::new()),
            running_changed,
            specs_changed,
            ready_flag: AtomicBool::new(false),
            ready_event: Event::new(),
        });

        let mut tasks = Vec::new();

        {
            let inner = inner.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = inner.refresh_specs().await {
                    log::warn!("initial kernel spec fetch failed: {}", err);
                }
                if let Err(err) = inner.refresh_running().await {
                    log::warn!("initial running session fetch failed: {}", err);
                }
                inner.ready_flag.store(true, Ordering::SeqCst);
                inner.ready_event.notify(usize::MAX);
            }));
        }

        {
            let inner = inner.clone();
            let interval = options.running_poll_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(err) = inner.refresh_running().await {
                        log::warn!("running session poll failed: {}", err);
                    }
                }
            }));
        }

        {
            let inner = inner.clone();
            let interval = options.specs_poll_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(err) = inner.refresh_specs().await {
                        log::warn!("kernel spec poll failed: {}", err);
                    }
                }
            }));
        }

        Self { inner, tasks }
    }

    /// Wait until the initial spec and running-list fetches have settled.
    pub async fn ready(&self) {
        loop {
            let listener = self.inner.ready_event.listen();
            if self.inner.ready_flag.load(Ordering::SeqCst) {
                return;
            }
            listener.await;
        }
    }

    /// The cached running list.
    pub fn running(&self) -> Vec<SessionModel> {
        self.inner.running.lock().unwrap().clone()
    }

    /// The cached spec bundle, if the first fetch has succeeded.
    pub fn specs(&self) -> Option<SpecsBundle> {
        self.inner.specs.lock().unwrap().clone()
    }

    /// Subscribe to running-list changes.
    pub fn running_changed(&self) -> broadcast::Receiver<Vec<SessionModel>> {
        self.inner.running_changed.subscribe()
    }

    /// Subscribe to spec bundle changes.
    pub fn specs_changed(&self) -> broadcast::Receiver<SpecsBundle> {
        self.inner.specs_changed.subscribe()
    }

    /// Refresh the running list now.
    pub async fn refresh_running(&self) -> Result<(), ClientError> {
        self.inner.refresh_running().await
    }

    /// Refresh the spec bundle now.
    pub async fn refresh_specs(&self) -> Result<(), ClientError> {
        self.inner.refresh_specs().await
    }

    /// Find a cached session model by path (first match).
    pub fn find_by_path(&self, path: &str) -> Option<SessionModel> {
        self.inner
            .running
            .lock()
            .unwrap()
            .iter()
            .find(|model| model.path == path)
            .cloned()
    }

    /// Find a cached session model by id.
    pub fn find_by_id(&self, id: &str) -> Option<SessionModel> {
        self.inner
            .running
            .lock()
            .unwrap()
            .iter()
            .find(|model| model.id == id)
            .cloned()
    }

    /// Create a session and start its kernel.
    pub async fn start_new(&self, options: SessionOptions) -> Result<Session, ClientError> {
        let session = Session::new(
            self.inner.settings.clone(),
            options,
            self.inner.connect_options.clone(),
        );
        session.start_kernel(None).await?;

        if let Some(id) = session.id() {
            self.inner
                .connected
                .lock()
                .unwrap()
                .insert(id, session.clone());
        }

        // Record the newcomer without waiting for the next poll
        if let Err(err) = self.inner.refresh_running().await {
            log::warn!("failed to refresh sessions after start: {}", err);
        }
        Ok(session)
    }

    /// Connect a coordinator to an existing session. Reuses the connected
    /// coordinator when this manager already has one for the id.
    pub fn connect_to(&self, model: SessionModel) -> Session {
        {
            let connected = self.inner.connected.lock().unwrap();
            if let Some(existing) = connected.get(&model.id) {
                if !existing.is_terminated() {
                    return existing.clone();
                }
            }
        }
        let session = Session::from_model(
            self.inner.settings.clone(),
            model.clone(),
            self.inner.connect_options.clone(),
        );
        self.inner
            .connected
            .lock()
            .unwrap()
            .insert(model.id, session.clone());
        session
    }

    /// Shut down a session by id. The cache drops the id optimistically.
    pub async fn shutdown(&self, id: &str) -> Result<(), ClientError> {
        let connected = self.inner.connected.lock().unwrap().remove(id);
        if let Some(session) = connected {
            session.shutdown().await?;
        } else {
            rest::shutdown_session(&self.inner.settings, id).await?;
        }

        let snapshot = {
            let mut running = self.inner.running.lock().unwrap();
            let before = running.len();
            running.retain(|model| model.id != id);
            if running.len() != before {
                Some(running.clone())
            } else {
                None
            }
        };
        if let Some(snapshot) = snapshot {
            let _ = self.inner.running_changed.send(snapshot);
        }
        Ok(())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

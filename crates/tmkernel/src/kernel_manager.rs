//
// kernel_manager.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Fleet view of the server's kernels: a polled cache of the running list
//! and the kernel spec bundle, with change signals that fire only when a
//! poll actually observes a difference.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use event_listener::Event;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use tmshared::kernel_spec::SpecsBundle;
use tmshared::models::KernelModel;

use crate::error::ClientError;
use crate::kernel_connection::{ConnectOptions, KernelConnection};
use crate::rest::{self, ServerSettings};
use crate::running_kernels;

/// Behavior knobs for the manager layer.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// How often to refresh the running list
    pub running_poll_interval: Duration,

    /// How often to refresh the spec bundle
    pub specs_poll_interval: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            running_poll_interval: Duration::from_secs(10),
            specs_poll_interval: Duration::from_secs(61),
        }
    }
}

struct KernelManagerInner {
    settings: ServerSettings,
    running: Mutex<Vec<KernelModel>>,
    specs: Mutex<Option<SpecsBundle>>,
    running_changed: broadcast::Sender<Vec<KernelModel>>,
    specs_changed: broadcast::Sender<SpecsBundle>,
    ready_flag: AtomicBool,
    ready_event: Event,
}

impl KernelManagerInner {
    /// Refresh the running list; the cache is replaced (and the change
    /// signal fired) only when the new snapshot differs.
    async fn refresh_running(&self) -> Result<(), ClientError> {
        let listed = rest::list_running_kernels(&self.settings).await?;

        // De-duplicate by id, preserving order
        let mut seen = std::collections::HashSet::new();
        let mut snapshot: Vec<KernelModel> = Vec::with_capacity(listed.len());
        for model in listed {
            if seen.insert(model.id.clone()) {
                snapshot.push(model);
            }
        }
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));

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
            log::debug!("running kernel list changed ({} kernels)", snapshot.len());
            let _ = self.running_changed.send(snapshot);
        }
        Ok(())
    }

    /// Refresh the spec bundle; the cache is replaced atomically on change.
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
            log::debug!(
                "kernel specs changed ({} specs, default '{}')",
                bundle.kernelspecs.len(),
                bundle.default
            );
            let _ = self.specs_changed.send(bundle);
        }
        Ok(())
    }
}

/// Tracks the server's kernels: one initial fetch of specs and the running
/// list at construction, then fixed-interval polls. Dropping the manager
/// stops its poll tasks.
pub struct KernelManager {
    inner: Arc<KernelManagerInner>,
    connect_options: ConnectOptions,
    tasks: Vec<JoinHandle<()>>,
}

impl KernelManager {
    pub fn new(settings: ServerSettings, options: ManagerOptions) -> Self {
        Self::with_connect_options(settings, options, ConnectOptions::default())
    }

    /// Create a manager whose kernels are connected with the given options.
    pub fn with_connect_options(
        settings: ServerSettings,
        options: ManagerOptions,
        connect_options: ConnectOptions,
    ) -> Self {
        let (running_changed, _) = broadcast::channel(64);
        let (specs_changed, _) = broadcast::channel(64);
        let inner = Arc::new(KernelManagerInner {
            settings,
            running: Mutex::new(Vec::new()),
            specs: Mutex::new(None),
            running_changed,
            specs_changed,
            ready_flag: AtomicBool::new(false),
            ready_event: Event::new(),
        });

        let mut tasks = Vec::new();

        // Initial fetches; ready resolves when both have settled
        {
            let inner = inner.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = inner.refresh_specs().await {
                    log::warn!("initial kernel spec fetch failed: {}", err);
                }
                if let Err(err) = inner.refresh_running().await {
                    log::warn!("initial running kernel fetch failed: {}", err);
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
                ticker.tick().await; // the first tick fires immediately
                loop {
                    ticker.tick().await;
                    if let Err(err) = inner.refresh_running().await {
                        log::warn!("running kernel poll failed: {}", err);
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

        Self {
            inner,
            connect_options,
            tasks,
        }
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
    pub fn running(&self) -> Vec<KernelModel> {
        self.inner.running.lock().unwrap().clone()
    }

    /// The cached spec bundle, if the first fetch has succeeded.
    pub fn specs(&self) -> Option<SpecsBundle> {
        self.inner.specs.lock().unwrap().clone()
    }

    /// Subscribe to running-list changes.
    pub fn running_changed(&self) -> broadcast::Receiver<Vec<KernelModel>> {
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

    /// Start a new kernel. With no name, the server's default spec is used.
    pub async fn start_new(&self, name: Option<&str>) -> Result<KernelConnection, ClientError> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self.default_spec_name().await?,
        };
        let kernel = KernelConnection::start_new(
            self.inner.settings.clone(),
            &name,
            self.connect_options.clone(),
        )
        .await?;

        // Record the newcomer right away so a shutdown before the next poll
        // still diffs correctly
        let model = KernelModel {
            id: kernel.id().to_string(),
            name: kernel.name().to_string(),
        };
        let snapshot = {
            let mut running = self.inner.running.lock().unwrap();
            if !running.iter().any(|existing| existing.id == model.id) {
                running.push(model);
                running.sort_by(|a, b| a.id.cmp(&b.id));
                Some(running.clone())
            } else {
                None
            }
        };
        if let Some(snapshot) = snapshot {
            let _ = self.inner.running_changed.send(snapshot);
        }

        Ok(kernel)
    }

    /// Connect to a running kernel by model; reuses a live engine when this
    /// process already has one for the id.
    pub fn connect_to(&self, model: KernelModel) -> KernelConnection {
        KernelConnection::connect_to(
            self.inner.settings.clone(),
            model,
            self.connect_options.clone(),
        )
    }

    async fn default_spec_name(&self) -> Result<String, ClientError> {
        if let Some(specs) = self.specs() {
            return Ok(specs.default);
        }
        let bundle = rest::list_kernel_specs(&self.inner.settings).await?;
        Ok(bundle.default)
    }

    /// Shut down a kernel by id. The cache drops the id optimistically.
    pub async fn shutdown(&self, id: &str) -> Result<(), ClientError> {
        if let Some(kernel) = running_kernels::find_running_kernel(id) {
            kernel.shutdown().await?;
        } else {
            rest::shutdown_kernel(&self.inner.settings, id).await?;
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

impl Drop for KernelManager {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

//
// kernel_connection.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! The kernel channel engine: one WebSocket connection to a kernel,
//! multiplexing many request/reply exchanges, routing unsolicited iopub
//! traffic, tracking kernel lifecycle state, and maintaining the comm
//! channels.
//!
//! The engine is a cheap-to-clone handle over a shared core. A single
//! channel worker task owns the managed socket and performs all frame
//! routing; handles interact with the core through short-lived locks and
//! hand outgoing frames to the worker over a channel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use event_listener::Event;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tmshared::jupyter_message::{
    ExecutionState, JupyterChannel, JupyterMessage, JupyterMessageHeader, JupyterStatus,
};
use tmshared::kernel_info::KernelInfoReply;
use tmshared::kernel_spec::KernelSpec;
use tmshared::models::KernelModel;
use tmshared::requests::{
    CommInfoReply, CommInfoRequest, CommMsg, CommOpen, CompleteReply, CompleteRequest,
    ExecuteRequest, HistoryReply, HistoryRequest, InputReply, InspectReply, InspectRequest,
    IsCompleteReply, IsCompleteRequest,
};
use tmshared::validate::validate_message;
use tmshared::wire_frame::{self, WireFrame};

use crate::comm::{
    Comm, CommShared, CommState, CommTargetCallback, CommTargetRegistration, CommTargetResolver,
};
use crate::error::ClientError;
use crate::managed_socket::{ManagedSocket, SocketFactory, TungsteniteFactory};
use crate::message_future::{FutureShared, MessageFuture};
use crate::rest::{self, ServerSettings};
use crate::running_kernels;

/// The version of the Jupyter messaging protocol stamped on outgoing headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// The lifecycle states of a kernel, from the client's point of view.
///
/// `Dead` is absorbing: once entered there are no transitions out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelStatus {
    Unknown,
    Starting,
    Idle,
    Busy,
    Restarting,
    Reconnecting,
    Dead,
}

/// Options for attaching a channel engine to a kernel.
#[derive(Clone)]
pub struct ConnectOptions {
    /// The username stamped on outgoing messages; defaults to the server
    /// settings' username
    pub username: Option<String>,

    /// The client session ID; generated when not supplied
    pub client_id: Option<String>,

    /// The WebSocket factory; tests inject an in-memory duplex here
    pub socket_factory: Arc<dyn SocketFactory>,

    /// How many consecutive connection failures to tolerate before the
    /// engine dies
    pub reconnect_limit: u32,

    /// The base delay of the exponential reconnect backoff
    pub backoff_base: Duration,

    /// Resolves comm targets from a module name for server-initiated opens
    pub target_resolver: Option<Arc<dyn CommTargetResolver>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            username: None,
            client_id: None,
            socket_factory: Arc::new(TungsteniteFactory),
            reconnect_limit: 7,
            backoff_base: Duration::from_secs(1),
            target_resolver: None,
        }
    }
}

#[derive(Default)]
struct PendingComm {
    /// comm_msg frames that arrived while the target was being resolved
    queued: Vec<JupyterMessage>,

    /// A comm_close that arrived while the target was being resolved
    close: Option<JupyterMessage>,
}

pub(crate) struct EngineInner {
    id: String,
    name: String,
    client_id: String,
    username: String,
    settings: ServerSettings,
    status: RwLock<KernelStatus>,
    futures: Mutex<HashMap<String, Arc<FutureShared>>>,
    comms: Mutex<HashMap<String, Arc<CommShared>>>,
    used_comm_ids: Mutex<HashSet<String>>,
    comm_targets: Mutex<HashMap<String, CommTargetCallback>>,
    pending_comms: Mutex<HashMap<String, PendingComm>>,
    target_resolver: Option<Arc<dyn CommTargetResolver>>,
    outbound_tx: async_channel::Sender<Message>,
    status_tx: broadcast::Sender<KernelStatus>,
    iopub_tx: broadcast::Sender<JupyterMessage>,
    unhandled_tx: broadcast::Sender<JupyterMessage>,
    disposed: AtomicBool,
    dispose_event: Event,
    shutting_down: AtomicBool,
    spec: tokio::sync::Mutex<Option<KernelSpec>>,
}

impl EngineInner {
    fn status(&self) -> KernelStatus {
        *self.status.read().unwrap()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn is_terminal(&self) -> bool {
        self.is_disposed() || self.status() == KernelStatus::Dead
    }

    /// Apply a status transition. Emits `status_changed` only on distinct
    /// transitions; `Dead` is absorbing.
    pub(crate) fn update_status(&self, status: KernelStatus) {
        {
            let mut current = self.status.write().unwrap();
            if *current == status || *current == KernelStatus::Dead {
                return;
            }
            *current = status;
        }
        log::debug!("[kernel {}] status changed to {:?}", self.id, status);
        let _ = self.status_tx.send(status);
    }

    /// Kill the engine: emit the terminal `Dead` status, reject every
    /// pending future, close every comm locally (no comm_close is sent; the
    /// server garbage-collects on kernel death), and remove the engine from
    /// the runtime registry. Idempotent.
    pub(crate) fn dispose_engine(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.update_status(KernelStatus::Dead);

        let futures: Vec<_> = {
            let mut futures = self.futures.lock().unwrap();
            futures.drain().map(|(_, future)| future).collect()
        };
        for future in futures {
            future.reject(ClientError::KernelTerminated);
        }

        let comms: Vec<_> = {
            let mut comms = self.comms.lock().unwrap();
            comms.drain().map(|(_, comm)| comm).collect()
        };
        for comm in comms {
            comm.close_local(None);
        }

        self.pending_comms.lock().unwrap().clear();
        self.comm_targets.lock().unwrap().clear();
        self.outbound_tx.close();
        running_kernels::remove(&self.id);
        self.dispose_event.notify(usize::MAX);
        log::info!("[kernel {}] channel engine disposed", self.id);
    }

    /// Dispose every future and comm without killing the engine; used by
    /// restart.
    fn clear_state(&self) {
        let futures: Vec<_> = {
            let mut futures = self.futures.lock().unwrap();
            futures.drain().map(|(_, future)| future).collect()
        };
        for future in futures {
            future.dispose();
        }

        let comms: Vec<_> = {
            let mut comms = self.comms.lock().unwrap();
            comms.drain().map(|(_, comm)| comm).collect()
        };
        for comm in comms {
            comm.close_local(None);
        }

        self.pending_comms.lock().unwrap().clear();
    }

    /// Build an outgoing message with a fresh header.
    fn build_message(
        &self,
        msg_type: &str,
        channel: JupyterChannel,
        content: Value,
        metadata: Value,
    ) -> JupyterMessage {
        JupyterMessage {
            header: JupyterMessageHeader {
                msg_id: Uuid::new_v4().to_string(),
                msg_type: msg_type.to_string(),
                username: self.username.clone(),
                session: self.client_id.clone(),
                version: PROTOCOL_VERSION.to_string(),
                date: Some(chrono::Utc::now().to_rfc3339()),
            },
            parent_header: None,
            channel,
            content,
            metadata,
            buffers: Vec::new(),
        }
    }

    /// Encode a message and hand it to the channel worker.
    fn send_frame(&self, msg: &JupyterMessage) -> Result<(), ClientError> {
        let frame = wire_frame::encode(msg)
            .map_err(|err| ClientError::MalformedFrame(err.to_string()))?;
        self.outbound_tx
            .try_send(frame_message(frame))
            .map_err(|_| ClientError::KernelTerminated)
    }

    /// Register a future for a message about to be sent.
    fn install_future(
        &self,
        msg_id: &str,
        expect_reply: bool,
        dispose_on_done: bool,
    ) -> Arc<FutureShared> {
        let shared = FutureShared::new(msg_id.to_string(), expect_reply, dispose_on_done);
        self.futures
            .lock()
            .unwrap()
            .insert(msg_id.to_string(), shared.clone());
        shared
    }

    /// Send a message and return its future. Fails synchronously with
    /// `KernelDead` on a terminal engine.
    fn create_future(
        self: &Arc<Self>,
        msg: JupyterMessage,
        expect_reply: bool,
        dispose_on_done: bool,
    ) -> Result<MessageFuture, ClientError> {
        if self.is_terminal() {
            return Err(ClientError::KernelDead);
        }
        let shared = self.install_future(&msg.header.msg_id, expect_reply, dispose_on_done);
        if let Err(err) = self.send_frame(&msg) {
            self.remove_future(&msg.header.msg_id);
            return Err(err);
        }
        Ok(MessageFuture::new(shared, Arc::downgrade(self)))
    }

    pub(crate) fn remove_future(&self, msg_id: &str) {
        self.futures.lock().unwrap().remove(msg_id);
    }

    pub(crate) fn remove_comm(&self, comm_id: &str) {
        self.comms.lock().unwrap().remove(comm_id);
    }

    pub(crate) fn remove_comm_target(&self, name: &str) {
        self.comm_targets.lock().unwrap().remove(name);
    }

    /// Send a comm message as a plain shell request (no reply expected; a
    /// disposable future swallows the request's status chatter).
    pub(crate) fn send_comm_message(
        self: &Arc<Self>,
        msg_type: &str,
        content: Value,
        metadata: Value,
    ) -> Result<(), ClientError> {
        let msg = self.build_message(msg_type, JupyterChannel::Shell, content, metadata);
        self.create_future(msg, false, true).map(|_| ())
    }

    /// Route one validated frame. Returns true when the frame was a kernel
    /// status that permits flushing queued sends (starting, idle, or busy).
    fn route_frame(self: &Arc<Self>, msg: JupyterMessage) -> bool {
        // A frame claimed by a live future is delivered to it before any
        // broadcast sees it.
        let mut claimed = false;
        if let Some(parent_id) = msg.parent_msg_id().map(str::to_string) {
            let future = self.futures.lock().unwrap().get(&parent_id).cloned();
            if let Some(future) = future {
                claimed = true;
                let completed = match msg.channel {
                    JupyterChannel::Shell | JupyterChannel::Control => {
                        future.handle_reply(msg.clone())
                    }
                    JupyterChannel::IOPub => future.handle_iopub(&msg),
                    JupyterChannel::Stdin => {
                        future.handle_stdin(&msg);
                        false
                    }
                };
                if completed && future.dispose_on_done() {
                    self.remove_future(&parent_id);
                }
            }
        }

        let mut runnable = false;
        if msg.channel == JupyterChannel::IOPub {
            match msg.header.msg_type.as_str() {
                "status" => {
                    if let Ok(status) = serde_json::from_value::<JupyterStatus>(msg.content.clone())
                    {
                        if status.execution_state == ExecutionState::Dead {
                            // Emit the frame before the engine goes silent
                            let _ = self.iopub_tx.send(msg.clone());
                            if !claimed {
                                let _ = self.unhandled_tx.send(msg);
                            }
                            self.dispose_engine();
                            return false;
                        }
                        runnable = self.apply_execution_state(status.execution_state);
                    }
                }
                "comm_open" => self.handle_comm_open(msg.clone()),
                "comm_msg" => self.handle_comm_msg(&msg),
                "comm_close" => self.handle_comm_close(&msg),
                _ => {}
            }
            let _ = self.iopub_tx.send(msg.clone());
        }

        if !claimed {
            let _ = self.unhandled_tx.send(msg);
        }
        runnable
    }

    fn apply_execution_state(&self, state: ExecutionState) -> bool {
        match state {
            ExecutionState::Starting => {
                self.update_status(KernelStatus::Starting);
                true
            }
            ExecutionState::Idle => {
                self.update_status(KernelStatus::Idle);
                true
            }
            ExecutionState::Busy => {
                self.update_status(KernelStatus::Busy);
                true
            }
            ExecutionState::Restarting => {
                self.update_status(KernelStatus::Restarting);
                false
            }
            ExecutionState::Reconnecting => {
                self.update_status(KernelStatus::Reconnecting);
                false
            }
            // Dead is handled by the caller
            ExecutionState::Dead => false,
        }
    }

    /// Handle a server-initiated comm_open.
    fn handle_comm_open(self: &Arc<Self>, msg: JupyterMessage) {
        let content: CommOpen = match serde_json::from_value(msg.content.clone()) {
            Ok(content) => content,
            Err(err) => {
                log::error!("[kernel {}] malformed comm_open content: {}", self.id, err);
                return;
            }
        };

        // Comm ids are never recycled within an engine's lifetime
        {
            let mut used = self.used_comm_ids.lock().unwrap();
            if !used.insert(content.comm_id.clone()) {
                log::warn!(
                    "[kernel {}] ignoring comm_open for already-used comm id {}",
                    self.id,
                    content.comm_id
                );
                return;
            }
        }

        // A locally registered target wins even when a target_module is set
        let local = self
            .comm_targets
            .lock()
            .unwrap()
            .get(&content.target_name)
            .cloned();
        if let Some(callback) = local {
            self.open_server_comm(&content.comm_id, &content.target_name, callback, msg);
            return;
        }

        if let (Some(module), Some(resolver)) =
            (content.target_module.clone(), self.target_resolver.clone())
        {
            // Resolve asynchronously; traffic for the comm queues behind the
            // pending resolution.
            self.pending_comms
                .lock()
                .unwrap()
                .insert(content.comm_id.clone(), PendingComm::default());
            let inner = self.clone();
            tokio::spawn(async move {
                match resolver.resolve(&module, &content.target_name).await {
                    Ok(callback) => {
                        inner.open_server_comm(
                            &content.comm_id,
                            &content.target_name,
                            callback,
                            msg,
                        );
                    }
                    Err(err) => {
                        log::error!(
                            "[kernel {}] failed to resolve comm target '{}' from module '{}': {}",
                            inner.id,
                            content.target_name,
                            module,
                            err
                        );
                        inner.pending_comms.lock().unwrap().remove(&content.comm_id);
                        inner.send_comm_close_back(&content.comm_id);
                    }
                }
            });
            return;
        }

        log::error!(
            "[kernel {}] {}",
            self.id,
            ClientError::CommTargetNotFound(content.target_name)
        );
        self.send_comm_close_back(&content.comm_id);
    }

    /// Install a server-initiated comm and run its target callback, then
    /// release any traffic that queued behind the open.
    fn open_server_comm(
        self: &Arc<Self>,
        comm_id: &str,
        target_name: &str,
        callback: CommTargetCallback,
        open_msg: JupyterMessage,
    ) {
        let pending = self.pending_comms.lock().unwrap().remove(comm_id);
        let shared = CommShared::new(comm_id.to_string(), target_name.to_string(), CommState::Open);
        self.comms
            .lock()
            .unwrap()
            .insert(comm_id.to_string(), shared.clone());
        shared.deliver_opened(open_msg.clone());

        let comm = Comm::new(shared.clone(), Arc::downgrade(self));
        if let Err(err) = callback(comm, &open_msg) {
            log::error!(
                "[kernel {}] comm target '{}' callback failed: {}",
                self.id,
                target_name,
                err
            );
            shared.close_local(None);
            self.remove_comm(comm_id);
            self.send_comm_close_back(comm_id);
            return;
        }

        if let Some(pending) = pending {
            for queued in pending.queued {
                shared.deliver_msg(queued);
            }
            if let Some(close) = pending.close {
                shared.close_local(Some(close));
                self.remove_comm(comm_id);
            }
        }
    }

    fn handle_comm_msg(&self, msg: &JupyterMessage) {
        let content: CommMsg = match serde_json::from_value(msg.content.clone()) {
            Ok(content) => content,
            Err(err) => {
                log::error!("[kernel {}] malformed comm_msg content: {}", self.id, err);
                return;
            }
        };

        let comm = self.comms.lock().unwrap().get(&content.comm_id).cloned();
        if let Some(comm) = comm {
            comm.deliver_msg(msg.clone());
            return;
        }

        let mut pending = self.pending_comms.lock().unwrap();
        if let Some(entry) = pending.get_mut(&content.comm_id) {
            entry.queued.push(msg.clone());
            return;
        }
        drop(pending);

        log::debug!(
            "[kernel {}] dropping comm_msg for unknown comm {}",
            self.id,
            content.comm_id
        );
    }

    fn handle_comm_close(&self, msg: &JupyterMessage) {
        let content: CommMsg = match serde_json::from_value(msg.content.clone()) {
            Ok(content) => content,
            Err(err) => {
                log::error!("[kernel {}] malformed comm_close content: {}", self.id, err);
                return;
            }
        };

        let comm = self.comms.lock().unwrap().remove(&content.comm_id);
        if let Some(comm) = comm {
            comm.close_local(Some(msg.clone()));
            return;
        }

        let mut pending = self.pending_comms.lock().unwrap();
        if let Some(entry) = pending.get_mut(&content.comm_id) {
            entry.close = Some(msg.clone());
            return;
        }
        drop(pending);

        log::debug!(
            "[kernel {}] dropping comm_close for unknown comm {}",
            self.id,
            content.comm_id
        );
    }

    /// Close a comm back toward the kernel; used when an open cannot be
    /// honored.
    fn send_comm_close_back(self: &Arc<Self>, comm_id: &str) {
        let content = json!({ "comm_id": comm_id, "data": {} });
        if let Err(err) = self.send_comm_message("comm_close", content, json!({})) {
            log::warn!(
                "[kernel {}] failed to close back comm {}: {}",
                self.id,
                comm_id,
                err
            );
        }
    }
}

/// A connection to a running kernel's channels.
///
/// Cloning is cheap; all clones share the engine.
#[derive(Clone)]
pub struct KernelConnection {
    inner: Arc<EngineInner>,
}

impl KernelConnection {
    /// Start a new kernel from the named spec and connect to its channels.
    pub async fn start_new(
        settings: ServerSettings,
        name: &str,
        options: ConnectOptions,
    ) -> Result<Self, ClientError> {
        let model = rest::start_kernel(&settings, name).await?;
        log::info!("[kernel {}] started new '{}' kernel", model.id, model.name);
        Ok(Self::connect_to(settings, model, options))
    }

    /// Connect to a known running kernel. If an engine for the kernel's id
    /// is already live in this process, that engine (and its socket) is
    /// reused and `options` are ignored.
    pub fn connect_to(
        settings: ServerSettings,
        model: KernelModel,
        options: ConnectOptions,
    ) -> Self {
        let mut registry = running_kernels::registry().lock().unwrap();
        if let Some(existing) = registry.get(&model.id) {
            if !existing.is_disposed() {
                log::debug!("[kernel {}] reusing existing channel engine", model.id);
                return existing.clone();
            }
        }
        let engine = Self::launch(settings, model, options);
        registry.insert(engine.id().to_string(), engine.clone());
        engine
    }

    fn launch(settings: ServerSettings, model: KernelModel, options: ConnectOptions) -> Self {
        let client_id = options
            .client_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let username = options
            .username
            .unwrap_or_else(|| settings.username().to_string());
        let url = settings.ws_channels_url(&model.id, &client_id);

        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (status_tx, _) = broadcast::channel(256);
        let (iopub_tx, _) = broadcast::channel(256);
        let (unhandled_tx, _) = broadcast::channel(256);

        let inner = Arc::new(EngineInner {
            id: model.id.clone(),
            name: model.name,
            client_id: client_id.clone(),
            username,
            settings,
            status: RwLock::new(KernelStatus::Unknown),
            futures: Mutex::new(HashMap::new()),
            comms: Mutex::new(HashMap::new()),
            used_comm_ids: Mutex::new(HashSet::new()),
            comm_targets: Mutex::new(HashMap::new()),
            pending_comms: Mutex::new(HashMap::new()),
            target_resolver: options.target_resolver,
            outbound_tx,
            status_tx,
            iopub_tx,
            unhandled_tx,
            disposed: AtomicBool::new(false),
            dispose_event: Event::new(),
            shutting_down: AtomicBool::new(false),
            spec: tokio::sync::Mutex::new(None),
        });

        let socket = ManagedSocket::new(
            url,
            options.socket_factory,
            options.reconnect_limit,
            options.backoff_base,
        );
        let worker = ChannelWorker {
            inner: inner.clone(),
            socket,
            outbound_rx,
        };
        tokio::spawn(worker.run());

        log::debug!(
            "[kernel {}] channel engine attached (client {})",
            model.id,
            client_id
        );
        Self { inner }
    }

    /// The server-assigned kernel ID.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The name of the kernel spec the kernel was started from.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The client session ID carried on the channels URL and on outgoing
    /// message headers.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// The kernel's current status.
    pub fn status(&self) -> KernelStatus {
        self.inner.status()
    }

    /// Whether the engine has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Subscribe to status transitions. Fires on distinct transitions only,
    /// never after `Dead`.
    pub fn status_changed(&self) -> broadcast::Receiver<KernelStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Subscribe to every iopub message the engine receives.
    pub fn iopub_messages(&self) -> broadcast::Receiver<JupyterMessage> {
        self.inner.iopub_tx.subscribe()
    }

    /// Subscribe to messages no future claimed.
    pub fn unhandled_messages(&self) -> broadcast::Receiver<JupyterMessage> {
        self.inner.unhandled_tx.subscribe()
    }

    /// Send a message on the shell channel and return its future.
    ///
    /// This is the generic request primitive; the typed wrappers go through
    /// it. Fails synchronously with [`ClientError::KernelDead`] on a
    /// terminal engine.
    pub fn send_shell_message(
        &self,
        msg_type: &str,
        content: Value,
        expect_reply: bool,
        dispose_on_done: bool,
    ) -> Result<MessageFuture, ClientError> {
        let msg = self
            .inner
            .build_message(msg_type, JupyterChannel::Shell, content, json!({}));
        self.inner.create_future(msg, expect_reply, dispose_on_done)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        msg_type: &str,
        content: Value,
    ) -> Result<T, ClientError> {
        let future = self.send_shell_message(msg_type, content, true, true)?;
        let reply = future.reply().await?;
        serde_json::from_value(reply.content)
            .map_err(|err| ClientError::MalformedModel(err.to_string()))
    }

    /// Fetch the kernel's info block.
    pub async fn kernel_info(&self) -> Result<KernelInfoReply, ClientError> {
        self.request("kernel_info_request", json!({})).await
    }

    /// Request code completions.
    pub async fn complete(&self, request: CompleteRequest) -> Result<CompleteReply, ClientError> {
        self.request("complete_request", to_content(&request)?).await
    }

    /// Request object introspection.
    pub async fn inspect(&self, request: InspectRequest) -> Result<InspectReply, ClientError> {
        self.request("inspect_request", to_content(&request)?).await
    }

    /// Fetch execution history.
    pub async fn history(&self, request: HistoryRequest) -> Result<HistoryReply, ClientError> {
        self.request("history_request", to_content(&request)?).await
    }

    /// Ask whether a block of code is complete.
    pub async fn is_complete(
        &self,
        request: IsCompleteRequest,
    ) -> Result<IsCompleteReply, ClientError> {
        self.request("is_complete_request", to_content(&request)?)
            .await
    }

    /// List the kernel-side comms.
    pub async fn comm_info(&self, request: CommInfoRequest) -> Result<CommInfoReply, ClientError> {
        self.request("comm_info_request", to_content(&request)?)
            .await
    }

    /// Execute code. The future is disposed when the execution completes;
    /// use [`KernelConnection::execute_with_options`] to keep it.
    pub fn execute(&self, request: ExecuteRequest) -> Result<MessageFuture, ClientError> {
        self.execute_with_options(request, true)
    }

    /// Execute code, controlling whether the future is disposed on
    /// completion.
    pub fn execute_with_options(
        &self,
        request: ExecuteRequest,
        dispose_on_done: bool,
    ) -> Result<MessageFuture, ClientError> {
        self.send_shell_message("execute_request", to_content(&request)?, true, dispose_on_done)
    }

    /// Answer an input_request on the stdin channel. Fire-and-forget; fails
    /// synchronously with [`ClientError::KernelDead`] on a terminal engine.
    pub fn send_input_reply(&self, reply: InputReply) -> Result<(), ClientError> {
        if self.inner.is_terminal() {
            return Err(ClientError::KernelDead);
        }
        let msg = self.inner.build_message(
            "input_reply",
            JupyterChannel::Stdin,
            to_content(&reply)?,
            json!({}),
        );
        self.inner.send_frame(&msg)
    }

    /// Interrupt the kernel.
    pub async fn interrupt(&self) -> Result<(), ClientError> {
        if self.inner.is_terminal() {
            return Err(ClientError::KernelDead);
        }
        rest::interrupt_kernel(&self.inner.settings, &self.inner.id).await
    }

    /// Restart the kernel. Every pending future and open comm is disposed
    /// first; the connection itself survives the restart.
    pub async fn restart(&self) -> Result<(), ClientError> {
        if self.inner.is_terminal() {
            return Err(ClientError::KernelDead);
        }
        log::info!("[kernel {}] restarting", self.inner.id);
        self.inner.clear_state();
        self.inner.update_status(KernelStatus::Restarting);
        rest::restart_kernel(&self.inner.settings, &self.inner.id)
            .await
            .map(|_model| ())
    }

    /// Shut the kernel down and dispose the engine.
    ///
    /// Safe to call concurrently: exactly one DELETE is issued and every
    /// caller resolves once the engine is disposed.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        loop {
            if self.inner.is_disposed() {
                return Ok(());
            }
            if !self.inner.shutting_down.swap(true, Ordering::SeqCst) {
                log::info!("[kernel {}] shutting down", self.inner.id);
                match rest::shutdown_kernel(&self.inner.settings, &self.inner.id).await {
                    Ok(()) => {
                        self.inner.dispose_engine();
                        return Ok(());
                    }
                    Err(err) => {
                        self.inner.shutting_down.store(false, Ordering::SeqCst);
                        self.inner.dispose_event.notify(usize::MAX);
                        return Err(err);
                    }
                }
            }
            // Another caller owns the DELETE; wait for it to settle
            let listener = self.inner.dispose_event.listen();
            if self.inner.is_disposed() {
                return Ok(());
            }
            if !self.inner.shutting_down.load(Ordering::SeqCst) {
                continue;
            }
            listener.await;
        }
    }

    /// Register a comm target for server-initiated opens. The registration
    /// lives until the returned guard is disposed or dropped.
    pub fn register_comm_target(
        &self,
        name: &str,
        callback: impl Fn(Comm, &JupyterMessage) -> Result<(), anyhow::Error> + Send + Sync + 'static,
    ) -> CommTargetRegistration {
        self.inner
            .comm_targets
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(callback));
        CommTargetRegistration {
            name: name.to_string(),
            engine: Arc::downgrade(&self.inner),
        }
    }

    /// Connect to a comm on the kernel side. If a comm with the given id
    /// already exists, it is returned; otherwise a new comm is installed
    /// (open it with [`Comm::open`]).
    pub fn connect_to_comm(
        &self,
        target_name: &str,
        comm_id: Option<String>,
    ) -> Result<Comm, ClientError> {
        if self.inner.is_terminal() {
            return Err(ClientError::KernelDead);
        }
        let comm_id = comm_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        {
            let comms = self.inner.comms.lock().unwrap();
            if let Some(existing) = comms.get(&comm_id) {
                return Ok(Comm::new(existing.clone(), Arc::downgrade(&self.inner)));
            }
        }
        self.inner
            .used_comm_ids
            .lock()
            .unwrap()
            .insert(comm_id.clone());
        let shared = CommShared::new(comm_id.clone(), target_name.to_string(), CommState::Open);
        self.inner
            .comms
            .lock()
            .unwrap()
            .insert(comm_id, shared.clone());
        Ok(Comm::new(shared, Arc::downgrade(&self.inner)))
    }

    /// The kernel's spec, memoized after the first fetch.
    pub async fn get_spec(&self) -> Result<KernelSpec, ClientError> {
        let mut memo = self.inner.spec.lock().await;
        if let Some(spec) = &*memo {
            return Ok(spec.clone());
        }
        let bundle = rest::list_kernel_specs(&self.inner.settings).await?;
        let spec = bundle
            .kernelspecs
            .get(&self.inner.name)
            .cloned()
            .ok_or_else(|| {
                ClientError::MalformedModel(format!(
                    "server reports no kernel spec named '{}'",
                    self.inner.name
                ))
            })?;
        *memo = Some(spec.clone());
        Ok(spec)
    }

    /// Dispose the engine without shutting the kernel down server-side.
    pub fn dispose(&self) {
        self.inner.dispose_engine();
    }
}

fn to_content<T: serde::Serialize>(value: &T) -> Result<Value, ClientError> {
    serde_json::to_value(value).map_err(|err| ClientError::MalformedModel(err.to_string()))
}

fn frame_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text),
        WireFrame::Binary(data) => Message::Binary(data),
    }
}

/// The channel worker: owns the managed socket, pumps frames in both
/// directions, and drives reconnection.
struct ChannelWorker {
    inner: Arc<EngineInner>,
    socket: ManagedSocket,
    outbound_rx: async_channel::Receiver<Message>,
}

impl ChannelWorker {
    async fn run(mut self) {
        loop {
            if self.inner.is_disposed() {
                return;
            }

            // Dial (or redial) the server
            let connected = tokio::select! {
                result = self.socket.connect() => result,
                _ = self.inner.dispose_event.listen() => return,
            };
            if let Err(err) = connected {
                log::warn!(
                    "[kernel {}] websocket connection failed: {}",
                    self.inner.id,
                    err
                );
                if !self.backoff().await {
                    return;
                }
                continue;
            }
            log::debug!("[kernel {}] websocket connected", self.inner.id);

            // Ask for kernel info right away; the status chatter the request
            // provokes is what opens the send gate after a (re)connect.
            if let Err(err) = self.send_startup_info().await {
                log::warn!(
                    "[kernel {}] failed to send kernel_info_request: {}",
                    self.inner.id,
                    err
                );
                self.socket.mark_lost();
                if !self.backoff().await {
                    return;
                }
                continue;
            }

            // Pump until the connection drops or the engine is disposed
            if !self.pump().await {
                return;
            }
            self.socket.mark_lost();
            if !self.backoff().await {
                return;
            }
        }
    }

    /// Wait out the reconnect backoff. Returns false when the engine should
    /// stop (budget exhausted or disposed).
    async fn backoff(&mut self) -> bool {
        match self.socket.next_backoff() {
            Some(delay) => {
                log::info!(
                    "[kernel {}] reconnecting in {:?} ({} message(s) queued)",
                    self.inner.id,
                    delay,
                    self.socket.queued()
                );
                self.inner.update_status(KernelStatus::Reconnecting);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => !self.inner.is_disposed(),
                    _ = self.inner.dispose_event.listen() => false,
                }
            }
            None => {
                log::error!(
                    "[kernel {}] {}",
                    self.inner.id,
                    ClientError::ReconnectExhausted
                );
                self.inner.dispose_engine();
                false
            }
        }
    }

    /// Pump frames until something interrupts. Returns true when the
    /// connection was lost (reconnect), false when the engine should stop.
    async fn pump(&mut self) -> bool {
        loop {
            tokio::select! {
                frame = self.outbound_rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            if let Err(err) = self.socket.send(frame).await {
                                log::warn!(
                                    "[kernel {}] websocket send failed: {}",
                                    self.inner.id,
                                    err
                                );
                                return true;
                            }
                        }
                        // The outbound channel closes on disposal
                        Err(_) => return false,
                    }
                }
                incoming = self.socket.next() => {
                    match incoming {
                        Some(Ok(message)) => {
                            let runnable = self.handle_incoming(message);
                            if self.inner.is_disposed() {
                                return false;
                            }
                            if runnable && !self.socket.gate_open() {
                                self.socket.open_gate();
                                if let Err(err) = self.socket.flush_queue().await {
                                    log::warn!(
                                        "[kernel {}] flush of queued messages failed: {}",
                                        self.inner.id,
                                        err
                                    );
                                    return true;
                                }
                            }
                        }
                        Some(Err(err)) => {
                            log::warn!("[kernel {}] websocket error: {}", self.inner.id, err);
                            return true;
                        }
                        None => {
                            log::info!("[kernel {}] websocket closed", self.inner.id);
                            return true;
                        }
                    }
                }
                _ = self.inner.dispose_event.listen() => return false,
            }
        }
    }

    /// Decode, validate, and route one incoming WebSocket message. Returns
    /// true when the frame was a status that permits flushing the queue.
    fn handle_incoming(&mut self, message: Message) -> bool {
        let decoded = match message {
            Message::Text(text) => wire_frame::decode_text(&text),
            Message::Binary(data) => wire_frame::decode_binary(&data),
            // Pings and pongs are handled by the transport; a close frame is
            // followed by the stream ending
            _ => return false,
        };

        // Decode and validation failures never propagate; the frame is
        // dropped so a corrupted frame cannot wedge the engine
        let msg = match decoded {
            Ok(msg) => msg,
            Err(err) => {
                log::error!(
                    "[kernel {}] {}",
                    self.inner.id,
                    ClientError::MalformedFrame(err.to_string())
                );
                return false;
            }
        };
        if let Err(err) = validate_message(&msg) {
            log::error!(
                "[kernel {}] dropping invalid '{}' message: {}",
                self.inner.id,
                msg.header.msg_type,
                err
            );
            return false;
        }

        log::trace!(
            "[kernel {}] received {} message {} on {:?}",
            self.inner.id,
            msg.header.msg_type,
            msg.header.msg_id,
            msg.channel
        );
        self.inner.route_frame(msg)
    }

    /// Send a kernel_info_request directly (bypassing the send gate); called
    /// on every connect.
    async fn send_startup_info(&mut self) -> Result<(), anyhow::Error> {
        let msg = self
            .inner
            .build_message("kernel_info_request", JupyterChannel::Shell, json!({}), json!({}));
        self.inner.install_future(&msg.header.msg_id, true, true);
        let frame = match wire_frame::encode(&msg) {
            Ok(frame) => frame,
            Err(err) => {
                log::error!(
                    "[kernel {}] failed to encode kernel_info_request: {}",
                    self.inner.id,
                    err
                );
                return Ok(());
            }
        };
        self.socket.send_direct(frame_message(frame)).await
    }
}

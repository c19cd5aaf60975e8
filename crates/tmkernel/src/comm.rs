//
// comm.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Bidirectional comm channels, multiplexed over the kernel WebSocket.
//!
//! A comm is a named channel between one kernel-side object and one
//! client-side object. The client registers target names (or an asynchronous
//! target resolver) for kernel-initiated opens, and can open its own comms
//! toward kernel-side targets. Each comm surfaces its lifecycle as a single
//! stream of tagged [`CommEvent`]s.

use std::sync::{Arc, Mutex, Weak};

use async_channel::{Receiver, Sender};
use futures::future::BoxFuture;
use serde_json::Value;

use tmshared::jupyter_message::JupyterMessage;

use crate::error::ClientError;
use crate::kernel_connection::EngineInner;

/// The lifecycle states of a comm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommState {
    /// A server-initiated comm whose target is still being resolved
    Opening,

    /// The comm is open for traffic
    Open,

    /// The comm was closed (by either side) and delivers nothing further
    Closed,
}

/// An event on a comm's lifecycle stream.
#[derive(Debug, Clone)]
pub enum CommEvent {
    /// The comm was opened by the kernel; carries the `comm_open` message
    Opened(JupyterMessage),

    /// A `comm_msg` arrived for the comm
    Msg(JupyterMessage),

    /// The comm was closed; carries the `comm_close` message, or `None` when
    /// the close was local (engine disposal closes comms without a message)
    Closed(Option<JupyterMessage>),
}

/// The callback invoked when the kernel opens a comm against a registered
/// target. An error return closes the comm back immediately.
pub type CommTargetCallback =
    Arc<dyn Fn(Comm, &JupyterMessage) -> Result<(), anyhow::Error> + Send + Sync>;

/// Resolves comm targets from a module name, for kernel-initiated opens whose
/// `target_name` has no local registration. An optional injected capability;
/// without one, resolution uses only the local target registry.
pub trait CommTargetResolver: Send + Sync {
    fn resolve(
        &self,
        target_module: &str,
        target_name: &str,
    ) -> BoxFuture<'static, Result<CommTargetCallback, ClientError>>;
}

pub(crate) struct CommShared {
    comm_id: String,
    target_name: String,
    state: Mutex<CommState>,
    events_tx: Sender<CommEvent>,
    events_rx: Receiver<CommEvent>,
}

impl CommShared {
    pub fn new(comm_id: String, target_name: String, state: CommState) -> Arc<Self> {
        let (events_tx, events_rx) = async_channel::unbounded();
        Arc::new(Self {
            comm_id,
            target_name,
            state: Mutex::new(state),
            events_tx,
            events_rx,
        })
    }

    pub fn comm_id(&self) -> &str {
        &self.comm_id
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn state(&self) -> CommState {
        *self.state.lock().unwrap()
    }

    pub fn deliver_opened(&self, msg: JupyterMessage) {
        let _ = self.events_tx.try_send(CommEvent::Opened(msg));
    }

    pub fn deliver_msg(&self, msg: JupyterMessage) {
        if self.state() == CommState::Closed {
            return;
        }
        let _ = self.events_tx.try_send(CommEvent::Msg(msg));
    }

    /// Transition to Closed and emit the close event. Idempotent; returns
    /// true only on the first close.
    pub fn close_local(&self, msg: Option<JupyterMessage>) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if *state == CommState::Closed {
                return false;
            }
            *state = CommState::Closed;
        }
        let _ = self.events_tx.try_send(CommEvent::Closed(msg));
        self.events_tx.close();
        true
    }
}

/// A handle to one comm channel.
#[derive(Clone)]
pub struct Comm {
    pub(crate) shared: Arc<CommShared>,
    pub(crate) engine: Weak<EngineInner>,
}

impl Comm {
    pub(crate) fn new(shared: Arc<CommShared>, engine: Weak<EngineInner>) -> Self {
        Self { shared, engine }
    }

    /// The comm ID; unique within the engine's lifetime.
    pub fn comm_id(&self) -> &str {
        self.shared.comm_id()
    }

    /// The name of the comm's target.
    pub fn target_name(&self) -> &str {
        self.shared.target_name()
    }

    /// The comm's current lifecycle state.
    pub fn comm_state(&self) -> CommState {
        self.shared.state()
    }

    /// The comm's event stream. The channel ends after the close event.
    pub fn events(&self) -> Receiver<CommEvent> {
        self.shared.events_rx.clone()
    }

    /// Open the comm toward the kernel-side target.
    pub fn open(&self, data: Value, metadata: Value) -> Result<(), ClientError> {
        if self.shared.state() == CommState::Closed {
            return Err(ClientError::CommClosed);
        }
        let engine = self.engine.upgrade().ok_or(ClientError::KernelTerminated)?;
        let content = serde_json::json!({
            "comm_id": self.comm_id(),
            "target_name": self.target_name(),
            "data": data,
        });
        engine.send_comm_message("comm_open", content, metadata)
    }

    /// Send a `comm_msg` over the comm.
    pub fn send(&self, data: Value, metadata: Value) -> Result<(), ClientError> {
        if self.shared.state() == CommState::Closed {
            return Err(ClientError::CommClosed);
        }
        let engine = self.engine.upgrade().ok_or(ClientError::KernelTerminated)?;
        let content = serde_json::json!({
            "comm_id": self.comm_id(),
            "data": data,
        });
        engine.send_comm_message("comm_msg", content, metadata)
    }

    /// Close the comm, notifying the kernel side. A second close is a no-op.
    pub fn close(&self, data: Value) -> Result<(), ClientError> {
        if !self.shared.close_local(None) {
            return Ok(());
        }
        let engine = match self.engine.upgrade() {
            Some(engine) => engine,
            // The engine is gone; the local close is all there is to do.
            None => return Ok(()),
        };
        engine.remove_comm(self.comm_id());
        let content = serde_json::json!({
            "comm_id": self.comm_id(),
            "data": data,
        });
        engine.send_comm_message("comm_close", content, serde_json::json!({}))
    }
}

/// Registration guard for a comm target; the target stays registered until
/// the guard is disposed or dropped.
pub struct CommTargetRegistration {
    pub(crate) name: String,
    pub(crate) engine: Weak<EngineInner>,
}

impl CommTargetRegistration {
    /// The registered target name.
    pub fn target_name(&self) -> &str {
        &self.name
    }

    /// Unregister the target.
    pub fn dispose(self) {
        // Drop does the work
    }
}

impl Drop for CommTargetRegistration {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.remove_comm_target(&self.name);
        }
    }
}

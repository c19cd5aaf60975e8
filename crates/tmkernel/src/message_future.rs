//
// message_future.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Per-request correlation: each shell or control request the engine sends is
//! tracked by a [`MessageFuture`] keyed by its message ID. The future routes
//! the single reply, the request's iopub side effects, and any stdin traffic,
//! and completes when both the reply (if one is expected) and the terminal
//! `idle` status have arrived, in either order.

use std::sync::{Arc, Mutex, Weak};

use async_channel::{Receiver, Sender};
use event_listener::Event;

use tmshared::jupyter_message::JupyterMessage;

use crate::error::ClientError;
use crate::kernel_connection::EngineInner;

/// An iopub hook; returning `false` suppresses delivery of the message to
/// this future (but not to the engine's broadcast signals).
pub type MessageHook = Box<dyn FnMut(&JupyterMessage) -> bool + Send>;

struct FutureState {
    reply: Option<JupyterMessage>,
    reply_received: bool,
    idle_received: bool,
    done: bool,
    disposed: bool,
    rejection: Option<ClientError>,
}

pub(crate) struct FutureShared {
    msg_id: String,
    expect_reply: bool,
    dispose_on_done: bool,
    state: Mutex<FutureState>,
    changed: Event,
    iopub_tx: Sender<JupyterMessage>,
    iopub_rx: Receiver<JupyterMessage>,
    stdin_tx: Sender<JupyterMessage>,
    stdin_rx: Receiver<JupyterMessage>,
    hooks: Mutex<Vec<MessageHook>>,
}

impl FutureShared {
    pub fn new(msg_id: String, expect_reply: bool, dispose_on_done: bool) -> Arc<Self> {
        let (iopub_tx, iopub_rx) = async_channel::unbounded();
        let (stdin_tx, stdin_rx) = async_channel::unbounded();
        Arc::new(Self {
            msg_id,
            expect_reply,
            dispose_on_done,
            state: Mutex::new(FutureState {
                reply: None,
                reply_received: false,
                idle_received: false,
                done: false,
                disposed: false,
                rejection: None,
            }),
            changed: Event::new(),
            iopub_tx,
            iopub_rx,
            stdin_tx,
            stdin_rx,
            hooks: Mutex::new(Vec::new()),
        })
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn dispose_on_done(&self) -> bool {
        self.dispose_on_done
    }

    /// Route the shell/control reply. Returns true when this completed the
    /// future.
    pub fn handle_reply(&self, msg: JupyterMessage) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.disposed || state.done {
                return false;
            }
            state.reply = Some(msg);
            state.reply_received = true;
        }
        self.changed.notify(usize::MAX);
        self.check_done()
    }

    /// Route an iopub message through the hooks and, unless suppressed, into
    /// the iopub stream. Returns true when this completed the future.
    pub fn handle_iopub(&self, msg: &JupyterMessage) -> bool {
        {
            let state = self.state.lock().unwrap();
            if state.disposed || state.done {
                return false;
            }
        }

        // Hooks run in LIFO registration order; the first false return
        // suppresses delivery of this message to the future entirely,
        // including its effect on the termination condition.
        {
            let mut hooks = self.hooks.lock().unwrap();
            for hook in hooks.iter_mut().rev() {
                if !hook(msg) {
                    return false;
                }
            }
        }

        let _ = self.iopub_tx.try_send(msg.clone());

        let is_idle = msg.header.msg_type == "status"
            && msg
                .content
                .get("execution_state")
                .and_then(|value| value.as_str())
                == Some("idle");
        if is_idle {
            self.state.lock().unwrap().idle_received = true;
            return self.check_done();
        }
        false
    }

    /// Route a stdin-channel message into the stdin stream.
    pub fn handle_stdin(&self, msg: &JupyterMessage) {
        let state = self.state.lock().unwrap();
        if state.disposed || state.done {
            return;
        }
        let _ = self.stdin_tx.try_send(msg.clone());
    }

    /// Abort the future; pending waiters resolve with the error.
    pub fn reject(&self, err: ClientError) {
        {
            let mut state = self.state.lock().unwrap();
            if state.disposed || state.done {
                return;
            }
            state.disposed = true;
            state.rejection = Some(err);
        }
        self.iopub_tx.close();
        self.stdin_tx.close();
        self.changed.notify(usize::MAX);
    }

    /// Stop delivery to this future. Idempotent; a future that already
    /// completed keeps its reply.
    pub fn dispose(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.disposed {
                return;
            }
            state.disposed = true;
        }
        self.iopub_tx.close();
        self.stdin_tx.close();
        self.changed.notify(usize::MAX);
    }

    fn check_done(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.done || state.disposed {
                return false;
            }
            if (self.expect_reply && !state.reply_received) || !state.idle_received {
                return false;
            }
            state.done = true;
        }
        // Close the streams so consumers see the end after draining what was
        // already delivered.
        self.iopub_tx.close();
        self.stdin_tx.close();
        self.changed.notify(usize::MAX);
        true
    }
}

/// The client-side handle for one outstanding request.
///
/// Dropping the handle does not dispose the future; the registry keeps
/// routing messages to it until it completes (or [`MessageFuture::dispose`]
/// is called).
#[derive(Clone)]
pub struct MessageFuture {
    shared: Arc<FutureShared>,
    engine: Weak<EngineInner>,
}

impl MessageFuture {
    pub(crate) fn new(shared: Arc<FutureShared>, engine: Weak<EngineInner>) -> Self {
        Self { shared, engine }
    }

    /// The message ID of the request this future tracks.
    pub fn msg_id(&self) -> &str {
        self.shared.msg_id()
    }

    /// Wait for the reply to the request.
    ///
    /// Errors with [`ClientError::KernelTerminated`] if the engine dies or
    /// the future is disposed first; a future created with
    /// `expect_reply = false` resolves the same way at completion, since no
    /// reply will ever come.
    pub async fn reply(&self) -> Result<JupyterMessage, ClientError> {
        loop {
            let listener = self.shared.changed.listen();
            {
                let state = self.shared.state.lock().unwrap();
                if let Some(reply) = &state.reply {
                    return Ok(reply.clone());
                }
                if let Some(err) = &state.rejection {
                    return Err(err.clone());
                }
                if state.disposed || state.done {
                    return Err(ClientError::KernelTerminated);
                }
            }
            listener.await;
        }
    }

    /// Wait for the termination condition: the reply (when one is expected)
    /// and the final `idle` status have both arrived.
    pub async fn done(&self) -> Result<(), ClientError> {
        loop {
            let listener = self.shared.changed.listen();
            {
                let state = self.shared.state.lock().unwrap();
                if state.done {
                    return Ok(());
                }
                if let Some(err) = &state.rejection {
                    return Err(err.clone());
                }
                if state.disposed {
                    return Err(ClientError::KernelTerminated);
                }
            }
            listener.await;
        }
    }

    /// Whether the termination condition has been met.
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().unwrap().done
    }

    /// The stream of iopub messages parented to this request, including the
    /// terminal `idle` status. The channel ends when the future completes or
    /// is disposed.
    pub fn iopub(&self) -> Receiver<JupyterMessage> {
        self.shared.iopub_rx.clone()
    }

    /// The stream of stdin-channel messages parented to this request.
    pub fn stdin(&self) -> Receiver<JupyterMessage> {
        self.shared.stdin_rx.clone()
    }

    /// Register an iopub hook. Hooks run in LIFO registration order; a
    /// `false` return suppresses delivery of that message to this future.
    pub fn register_message_hook(&self, hook: impl FnMut(&JupyterMessage) -> bool + Send + 'static) {
        self.shared.hooks.lock().unwrap().push(Box::new(hook));
    }

    /// Stop delivery and remove the future from the engine's registry.
    /// Idempotent; does not retract the server-side work.
    pub fn dispose(&self) {
        self.shared.dispose();
        if let Some(engine) = self.engine.upgrade() {
            engine.remove_future(self.shared.msg_id());
        }
    }
}

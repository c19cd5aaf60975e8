//
// mock_socket.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//

//! An in-memory WebSocket for driving the channel engine from tests.
//!
//! The factory replays a script of connection outcomes: each `connect` call
//! pops the next scripted outcome (a failure, or a fresh in-memory duplex).
//! When the script is empty, `connect` waits until the test pushes more, so
//! a test controls exactly when a reconnect succeeds.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use tmkernel::managed_socket::{SocketFactory, WsConnection};
use tmshared::jupyter_message::JupyterMessage;
use tmshared::wire_frame::{self, WireFrame};

enum Script {
    Fail,
    Connection {
        to_test: mpsc::UnboundedSender<Message>,
        from_test: mpsc::UnboundedReceiver<Result<Message, anyhow::Error>>,
    },
}

/// The test's end of one scripted connection.
pub struct MockConnectionHandle {
    to_engine: mpsc::UnboundedSender<Result<Message, anyhow::Error>>,
    from_engine: mpsc::UnboundedReceiver<Message>,
}

impl MockConnectionHandle {
    /// Inject a server-side message into the engine. Best-effort: an engine
    /// that already dropped the connection (death, disposal) swallows it,
    /// which is exactly what the silence tests assert.
    pub fn send_message(&self, msg: &JupyterMessage) {
        let frame = wire_frame::encode(msg).expect("failed to encode test message");
        let message = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(data) => Message::Binary(data),
        };
        let _ = self.to_engine.unbounded_send(Ok(message));
    }

    /// Inject raw text (for malformed-frame scenarios).
    pub fn send_text(&self, text: &str) {
        let _ = self
            .to_engine
            .unbounded_send(Ok(Message::Text(text.to_string())));
    }

    /// Drop the connection; the engine sees the stream end.
    pub fn close(&self) {
        self.to_engine.close_channel();
    }

    /// Wait for the next frame the engine sends, decoded.
    pub async fn expect_outgoing(&mut self) -> JupyterMessage {
        let message = tokio::time::timeout(Duration::from_secs(5), self.from_engine.next())
            .await
            .expect("timed out waiting for an outgoing message")
            .expect("connection closed while waiting for an outgoing message");
        decode_outgoing(message)
    }

    /// Assert that the engine sends nothing for the given window.
    pub async fn expect_quiet(&mut self, window: Duration) {
        match tokio::time::timeout(window, self.from_engine.next()).await {
            Err(_) => {}
            Ok(None) => {}
            Ok(Some(message)) => {
                panic!("unexpected outgoing message: {:?}", decode_outgoing(message))
            }
        }
    }

    /// Drain every frame the engine has sent so far.
    pub fn drain_outgoing(&mut self) -> Vec<JupyterMessage> {
        let mut drained = Vec::new();
        while let Ok(Some(message)) = self.from_engine.try_next() {
            drained.push(decode_outgoing(message));
        }
        drained
    }
}

fn decode_outgoing(message: Message) -> JupyterMessage {
    match message {
        Message::Text(text) => wire_frame::decode_text(&text).expect("engine sent malformed text"),
        Message::Binary(data) => {
            wire_frame::decode_binary(&data).expect("engine sent a malformed binary frame")
        }
        other => panic!("engine sent an unexpected frame: {:?}", other),
    }
}

struct FactoryState {
    scripts: Mutex<VecDeque<Script>>,
    urls: Mutex<Vec<String>>,
}

/// A scripted socket factory. Clones share the script.
#[derive(Clone)]
pub struct MockSocketFactory {
    state: Arc<FactoryState>,
}

impl MockSocketFactory {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FactoryState {
                scripts: Mutex::new(VecDeque::new()),
                urls: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Script one failed connection attempt.
    pub fn push_failure(&self) {
        self.state.scripts.lock().unwrap().push_back(Script::Fail);
    }

    /// Script one successful connection and return the test's end of it.
    pub fn push_connection(&self) -> MockConnectionHandle {
        let (to_test, from_engine) = mpsc::unbounded();
        let (to_engine, from_test) = mpsc::unbounded();
        self.state
            .scripts
            .lock()
            .unwrap()
            .push_back(Script::Connection { to_test, from_test });
        MockConnectionHandle {
            to_engine,
            from_engine,
        }
    }

    /// The URLs the engine has dialed.
    pub fn dialed_urls(&self) -> Vec<String> {
        self.state.urls.lock().unwrap().clone()
    }
}

impl SocketFactory for MockSocketFactory {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<WsConnection, anyhow::Error>> {
        let state = self.state.clone();
        let url = url.to_string();
        Box::pin(async move {
            state.urls.lock().unwrap().push(url);
            loop {
                let script = state.scripts.lock().unwrap().pop_front();
                match script {
                    Some(Script::Fail) => return Err(anyhow!("connection refused")),
                    Some(Script::Connection { to_test, from_test }) => {
                        return Ok(WsConnection {
                            sink: Box::pin(to_test.sink_map_err(anyhow::Error::new)),
                            stream: Box::pin(from_test),
                        })
                    }
                    // Nothing scripted yet; wait for the test to push more
                    None => tokio::time::sleep(Duration::from_millis(2)).await,
                }
            }
        })
    }
}

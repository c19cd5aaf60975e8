//
// managed_socket.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! A reconnecting WebSocket with an outgoing send queue.
//!
//! The socket is owned by the engine's channel worker task; nothing here is
//! shared. Payloads sent while the connection is down (or before the first
//! valid kernel status after a connect) queue in FIFO order, and a queued
//! payload is popped only after the underlying send returns, so a failed send
//! leaves it at the head for retry after the next reconnect.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// The sending half of a connected WebSocket.
pub type WsSink = Pin<Box<dyn Sink<Message, Error = anyhow::Error> + Send>>;

/// The receiving half of a connected WebSocket.
pub type WsStream = Pin<Box<dyn Stream<Item = Result<Message, anyhow::Error>> + Send>>;

/// A connected WebSocket, split into its two halves.
pub struct WsConnection {
    pub sink: WsSink,
    pub stream: WsStream,
}

/// Produces WebSocket connections. The engine takes the factory as an
/// injectable so tests can hand it an in-memory duplex.
pub trait SocketFactory: Send + Sync {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<WsConnection, anyhow::Error>>;
}

/// The default factory, backed by tokio-tungstenite.
pub struct TungsteniteFactory;

impl SocketFactory for TungsteniteFactory {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<WsConnection, anyhow::Error>> {
        let url = url.to_string();
        Box::pin(async move {
            let (stream, _response) = connect_async(url.as_str()).await?;
            let (sink, stream) = stream.split();
            Ok(WsConnection {
                sink: Box::pin(sink.sink_map_err(anyhow::Error::from)),
                stream: Box::pin(stream.map(|item| item.map_err(anyhow::Error::from))),
            })
        })
    }
}

/// The connection states of the managed socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
}

pub(crate) struct ManagedSocket {
    url: String,
    factory: Arc<dyn SocketFactory>,
    state: ConnectionState,
    connection: Option<WsConnection>,
    queue: VecDeque<Message>,
    flush_gate: bool,
    reconnect_attempt: u32,
    reconnect_limit: u32,
    backoff_base: Duration,
}

impl ManagedSocket {
    pub fn new(
        url: String,
        factory: Arc<dyn SocketFactory>,
        reconnect_limit: u32,
        backoff_base: Duration,
    ) -> Self {
        Self {
            url,
            factory,
            state: ConnectionState::Closed,
            connection: None,
            queue: VecDeque::new(),
            flush_gate: false,
            reconnect_attempt: 0,
            reconnect_limit,
            backoff_base,
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Dial the server once. On success the attempt counter resets, so only
    /// consecutive failures count against the reconnect budget. The flush
    /// gate stays closed until the first valid kernel status arrives.
    pub async fn connect(&mut self) -> Result<(), anyhow::Error> {
        self.state = ConnectionState::Connecting;
        match self.factory.connect(&self.url).await {
            Ok(connection) => {
                self.connection = Some(connection);
                self.state = ConnectionState::Open;
                self.reconnect_attempt = 0;
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Closed;
                Err(err)
            }
        }
    }

    /// Record a connection loss or failed attempt and compute the delay
    /// before the next attempt. Returns `None` when the budget is exhausted.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.reconnect_attempt >= self.reconnect_limit {
            return None;
        }
        let delay = self.backoff_base * 2u32.pow(self.reconnect_attempt.min(16));
        self.reconnect_attempt += 1;
        self.state = ConnectionState::Reconnecting;
        Some(delay)
    }

    /// Drop the connection. Queued payloads survive for the next connect.
    pub fn mark_lost(&mut self) {
        self.connection = None;
        self.flush_gate = false;
        if self.state == ConnectionState::Open {
            self.state = ConnectionState::Closed;
        }
    }

    /// Open the flush gate; called when the first valid kernel status arrives
    /// after a connect.
    pub fn open_gate(&mut self) {
        self.flush_gate = true;
    }

    pub fn gate_open(&self) -> bool {
        self.flush_gate
    }

    /// Send a payload, or queue it when the connection is down, the gate is
    /// closed, or older payloads are still queued ahead of it.
    pub async fn send(&mut self, frame: Message) -> Result<(), anyhow::Error> {
        if self.state == ConnectionState::Open && self.flush_gate && self.queue.is_empty() {
            if let Err(err) = self.send_direct(frame.clone()).await {
                self.queue.push_front(frame);
                return Err(err);
            }
            Ok(())
        } else {
            self.queue.push_back(frame);
            Ok(())
        }
    }

    /// Send a payload immediately, bypassing the queue and the gate.
    pub async fn send_direct(&mut self, frame: Message) -> Result<(), anyhow::Error> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| anyhow!("socket is not connected"))?;
        connection.sink.send(frame).await
    }

    /// Drain the queue in FIFO order. A payload is popped only after its send
    /// returns; on error the payload stays at the head.
    pub async fn flush_queue(&mut self) -> Result<(), anyhow::Error> {
        while let Some(frame) = self.queue.front().cloned() {
            self.send_direct(frame).await?;
            self.queue.pop_front();
        }
        Ok(())
    }

    /// Wait for the next message from the connection. Resolves to `None` when
    /// there is no connection or the peer closed it.
    pub async fn next(&mut self) -> Option<Result<Message, anyhow::Error>> {
        match self.connection.as_mut() {
            Some(connection) => connection.stream.next().await,
            None => None,
        }
    }
}

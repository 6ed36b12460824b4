// Inspector Socket - debug protocol transport
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! A single inspector connection: HTTP handshake, upgrade, then WebSocket frames
//!
//! The connection task is the only owner of the socket and of the active phase
//! handler. Phase handlers never perform I/O themselves; they return
//! [`Action`]s which the task executes in order, so a write always completes
//! before the protocol switch or the teardown that depends on it.
//!
//! The delegate talks back through a [`ConnectionHandle`]. Handle operations
//! are queued to the connection task and are silently dropped once the
//! connection is gone, so a handle may safely outlive its connection.

use crate::{
    error::ConnectionError,
    http::{accept_upgrade_response, HttpPhase},
    ws::{CloseState, WsPhase},
};
use std::{net::IpAddr, ops::ControlFlow, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, watch},
};
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Something the runtime above this layer must be told about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A plain `GET` request that did not ask for an upgrade
    HttpGet {
        /// `Host` header, empty if absent
        host: String,
        /// Request target
        path: String,
    },
    /// A valid WebSocket upgrade request awaiting accept or cancel
    Upgrade {
        /// `Host` header, empty if absent
        host: String,
        /// Request target
        path: String,
        /// Client `Sec-WebSocket-Key`
        ws_key: String,
    },
    /// Payload of one TEXT frame
    Frame(Vec<u8>),
}

/// Work a phase handler asks the connection to perform
#[derive(Debug)]
pub enum Action {
    /// Deliver an event to the delegate
    Emit(Event),
    /// Write bytes and keep going
    Write(Vec<u8>),
    /// Write bytes, then tear down; the reason is `None` for an orderly close
    WriteThenClose(Vec<u8>, Option<ConnectionError>),
    /// Tear down without writing anything
    Close(Option<ConnectionError>),
}

/// Externally visible state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Parsing HTTP requests
    Http,
    /// Upgraded, frames flow both ways
    WebSocketOpen,
    /// We sent a close frame and await the peer's
    WebSocketClosingLocal,
    /// The peer sent a close frame and ours is being written
    WebSocketClosingRemote,
    /// Socket released
    Closed,
}

/// Callbacks from a connection to the runtime that owns the debug session
///
/// All callbacks run on the connection task; operations requested through the
/// handle take effect after the callback returns.
pub trait ConnectionDelegate: Send + 'static {
    /// A plain `GET` request arrived.
    fn on_http_get(&mut self, conn: &ConnectionHandle, host: &str, path: &str);

    /// A valid upgrade request arrived. Answer with
    /// [`ConnectionHandle::accept_upgrade`] or [`ConnectionHandle::cancel_handshake`].
    fn on_socket_upgrade(&mut self, conn: &ConnectionHandle, host: &str, path: &str, ws_key: &str);

    /// A TEXT frame arrived on an upgraded connection.
    fn on_ws_frame(&mut self, conn: &ConnectionHandle, payload: &[u8]);

    /// The connection is gone. Called exactly once.
    fn on_closed(&mut self, _conn: &ConnectionHandle) {}
}

#[derive(Debug)]
enum Command {
    Write(Vec<u8>),
    AcceptUpgrade(String),
    CancelHandshake,
    Shutdown,
}

/// Cloneable handle used to drive a [`Connection`] from outside its task
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    phase: watch::Receiver<ConnectionPhase>,
    host: Arc<str>,
}

impl ConnectionHandle {
    /// Write raw bytes while in HTTP phase, or one TEXT frame once upgraded.
    pub fn write(&self, data: impl Into<Vec<u8>>) {
        self.send(Command::Write(data.into()));
    }

    /// Answer a pending upgrade request with `101 Switching Protocols`.
    pub fn accept_upgrade(&self, ws_key: &str) {
        self.send(Command::AcceptUpgrade(ws_key.to_string()));
    }

    /// Answer with `400 Bad Request` and close.
    pub fn cancel_handshake(&self) {
        self.send(Command::CancelHandshake);
    }

    /// Close the connection, running the close handshake if upgraded.
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    /// Local address the peer connected to, IPv6 in brackets
    pub fn peer_host(&self) -> &str {
        &self.host
    }

    /// Latest phase published by the connection task
    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    /// Whether the connection has released its socket
    pub fn is_closed(&self) -> bool {
        self.phase() == ConnectionPhase::Closed
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Connection already closed, dropping command");
        }
    }
}

/// Format an address the way it appears in a `Host` header.
pub fn format_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

enum Phase {
    Http(HttpPhase),
    Ws(WsPhase),
    Closed,
}

/// One inspector connection over any byte stream
pub struct Connection<S, D> {
    stream: S,
    delegate: D,
    phase: Phase,
    handle: ConnectionHandle,
    commands: mpsc::UnboundedReceiver<Command>,
    phase_tx: watch::Sender<ConnectionPhase>,
}

impl<D: ConnectionDelegate> Connection<TcpStream, D> {
    /// Wrap an accepted TCP stream; the peer host comes from its local address.
    pub fn from_tcp(stream: TcpStream, delegate: D) -> Self {
        let host = stream.local_addr().map(|addr| format_host(addr.ip())).unwrap_or_default();
        Self::new(stream, host, delegate)
    }
}

impl<S, D> Connection<S, D>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    D: ConnectionDelegate,
{
    /// Create a connection in HTTP phase.
    pub fn new(stream: S, peer_host: impl Into<String>, delegate: D) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(ConnectionPhase::Http);
        let handle = ConnectionHandle {
            commands: commands_tx,
            phase: phase_rx,
            host: Arc::from(peer_host.into()),
        };
        Self { stream, delegate, phase: Phase::Http(HttpPhase::new()), handle, commands, phase_tx }
    }

    /// Handle for driving this connection once it runs
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Current phase
    pub fn phase(&self) -> ConnectionPhase {
        match &self.phase {
            Phase::Http(_) => ConnectionPhase::Http,
            Phase::Ws(ws) => match ws.state() {
                CloseState::Open => ConnectionPhase::WebSocketOpen,
                CloseState::LocalInitiatedClose => ConnectionPhase::WebSocketClosingLocal,
                CloseState::RemoteInitiatedClose => ConnectionPhase::WebSocketClosingRemote,
                CloseState::Closed => ConnectionPhase::Closed,
            },
            Phase::Closed => ConnectionPhase::Closed,
        }
    }

    /// Serve the connection until it closes.
    ///
    /// The socket is shut down before this returns and the delegate's
    /// [`on_closed`](ConnectionDelegate::on_closed) has run. The error only
    /// explains why the connection ended; the delegate never sees it.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let result = self.serve().await;

        if let Phase::Ws(ws) = &mut self.phase {
            ws.on_eof();
        }
        self.switch_protocol(Phase::Closed);
        if let Err(err) = self.stream.shutdown().await {
            debug!("Socket shutdown failed: {}", err);
        }
        self.delegate.on_closed(&self.handle);

        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let flow = tokio::select! {
                biased;

                Some(command) = self.commands.recv() => self.on_command(command).await?,
                read = self.stream.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        debug!(phase = ?self.phase(), "Peer closed the connection");
                        return Ok(());
                    }
                    let actions = match &mut self.phase {
                        Phase::Http(http) => http.on_data(&buf[..n]),
                        Phase::Ws(ws) => ws.on_data(&buf[..n]),
                        Phase::Closed => return Ok(()),
                    };
                    self.apply(actions).await?
                }
            };
            if flow.is_break() {
                return Ok(());
            }
        }
    }

    async fn apply(&mut self, actions: Vec<Action>) -> Result<ControlFlow<()>, ConnectionError> {
        self.publish_phase();
        for action in actions {
            match action {
                Action::Emit(event) => self.dispatch(event),
                Action::Write(bytes) => self.write_raw(&bytes).await?,
                Action::WriteThenClose(bytes, reason) => {
                    self.write_raw(&bytes).await?;
                    if let Phase::Ws(ws) = &mut self.phase {
                        ws.on_close_written();
                    }
                    return reason.map_or(Ok(ControlFlow::Break(())), Err);
                }
                Action::Close(reason) => return reason.map_or(Ok(ControlFlow::Break(())), Err),
            }
        }
        self.publish_phase();
        Ok(ControlFlow::Continue(()))
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::HttpGet { host, path } => self.delegate.on_http_get(&self.handle, &host, &path),
            Event::Upgrade { host, path, ws_key } => {
                self.delegate.on_socket_upgrade(&self.handle, &host, &path, &ws_key)
            }
            Event::Frame(payload) => self.delegate.on_ws_frame(&self.handle, &payload),
        }
    }

    async fn on_command(&mut self, command: Command) -> Result<ControlFlow<()>, ConnectionError> {
        match command {
            Command::Write(data) => {
                let bytes = match &self.phase {
                    Phase::Http(_) => Some(data),
                    Phase::Ws(ws) => ws.write(&data),
                    Phase::Closed => None,
                };
                if let Some(bytes) = bytes {
                    self.write_raw(&bytes).await?;
                }
                Ok(ControlFlow::Continue(()))
            }
            Command::AcceptUpgrade(ws_key) => {
                if !matches!(self.phase, Phase::Http(_)) {
                    warn!("Ignoring accept_upgrade outside of the HTTP phase");
                    return Ok(ControlFlow::Continue(()));
                }
                self.write_raw(&accept_upgrade_response(&ws_key)).await?;
                debug!("Upgraded to WebSocket");
                self.switch_protocol(Phase::Ws(WsPhase::new()));
                Ok(ControlFlow::Continue(()))
            }
            Command::CancelHandshake => {
                let Phase::Http(http) = &mut self.phase else {
                    warn!("Ignoring cancel_handshake outside of the HTTP phase");
                    return Ok(ControlFlow::Continue(()));
                };
                let action = http.reject(ConnectionError::HandshakeRejected("declined by delegate"));
                self.apply(vec![action]).await
            }
            Command::Shutdown => {
                let actions = match &mut self.phase {
                    Phase::Ws(ws) => ws.shutdown(),
                    Phase::Http(_) | Phase::Closed => return Ok(ControlFlow::Break(())),
                };
                self.apply(actions).await
            }
        }
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Replace the active phase handler; the previous one is dropped.
    fn switch_protocol(&mut self, phase: Phase) {
        self.phase = phase;
        self.publish_phase();
    }

    fn publish_phase(&self) {
        self.phase_tx.send_replace(self.phase());
    }
}

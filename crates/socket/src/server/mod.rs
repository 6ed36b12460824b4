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

//! Inspector session server
//!
//! Accepts TCP connections, answers the DevTools discovery endpoints
//! (`/json`, `/json/list`, `/json/version`) and turns accepted upgrades on
//! `/<target-id>` into debug sessions. Session traffic is surfaced as
//! [`SessionEvent`]s; replies go back through [`ServerHandle::send`].
//!
//! The server listens on every address its host resolves to. It stops
//! accepting and closes its sessions once the [`InspectorServer`] and every
//! [`ServerHandle`] have been dropped.

pub mod target;

use crate::connection::{Connection, ConnectionDelegate, ConnectionHandle};
use eyre::{eyre, Result};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    net::SocketAddr,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use target::{format_host_port, format_ws_address, generate_id, Target, VersionInfo};
use tokio::{
    net::{lookup_host, TcpListener},
    sync::{broadcast, mpsc},
};
use tracing::{debug, info, warn};

/// Port the inspector listens on unless told otherwise
pub const DEFAULT_INSPECTOR_PORT: u16 = 9229;

/// Session lifecycle and traffic reported by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A front-end completed the WebSocket handshake
    Started {
        /// Id used to address the session
        session_id: u64,
    },
    /// A protocol message arrived from the front-end
    Message {
        /// Originating session
        session_id: u64,
        /// Message text
        text: String,
    },
    /// The session's connection closed
    Ended {
        /// Session that ended
        session_id: u64,
    },
}

/// Builder for [`InspectorServer`] with the inspector's usual defaults
#[derive(Debug, Clone)]
pub struct InspectorServerBuilder {
    host: String,
    port: u16,
    target_id: Option<String>,
    target_title: Option<String>,
    target_url: String,
    version: VersionInfo,
    publish_http: bool,
    publish_console: bool,
}

impl Default for InspectorServerBuilder {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_INSPECTOR_PORT,
            target_id: None,    // random UUID
            target_title: None, // process name and pid
            target_url: String::new(),
            version: VersionInfo::default(),
            publish_http: true,
            publish_console: true,
        }
    }
}

impl InspectorServerBuilder {
    /// Create a builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Host to listen on; every address it resolves to is bound
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Port to listen on (0 picks a free port)
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Fixed target id instead of a random one
    pub fn target_id(mut self, id: impl Into<String>) -> Self {
        self.target_id = Some(id.into());
        self
    }

    /// Title shown by front-ends
    pub fn target_title(mut self, title: impl Into<String>) -> Self {
        self.target_title = Some(title.into());
        self
    }

    /// URL shown by front-ends
    pub fn target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = url.into();
        self
    }

    /// Describe the target by the script it runs.
    ///
    /// The title becomes the script name as given and the URL its resolved
    /// `file://` path. A script that cannot be resolved keeps an empty URL.
    pub fn script(mut self, script_name: &str) -> Self {
        if script_name.is_empty() {
            return self;
        }
        self.target_title = Some(script_name.to_string());
        match std::fs::canonicalize(Path::new(script_name)) {
            Ok(path) => self.target_url = format!("file://{}", path.display()),
            Err(err) => debug!("Could not resolve script path {}: {}", script_name, err),
        }
        self
    }

    /// Contents of the `/json/version` response
    pub fn version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    /// Serve the `/json` discovery endpoints. When off, every plain `GET`
    /// is answered with `404` and only the WebSocket endpoint is usable.
    pub fn publish_http(mut self, enabled: bool) -> Self {
        self.publish_http = enabled;
        self
    }

    /// Print the `Debugger listening on ...` and `Debugger ending on ...`
    /// lines to stderr.
    pub fn publish_console(mut self, enabled: bool) -> Self {
        self.publish_console = enabled;
        self
    }

    /// Bind the listeners and start accepting connections.
    pub async fn start(self) -> Result<InspectorServer> {
        let listeners = bind_all(&self.host, self.port).await?;
        let local_addrs =
            listeners.iter().map(TcpListener::local_addr).collect::<std::io::Result<Vec<_>>>()?;
        let mut ports: Vec<u16> = local_addrs.iter().map(SocketAddr::port).collect();
        ports.dedup();

        let target = Target {
            id: self.target_id.unwrap_or_else(generate_id),
            title: self.target_title.unwrap_or_else(human_readable_process_name),
            url: self.target_url,
        };
        let (events_tx, events) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(ServerState {
            target,
            version: self.version,
            host: self.host,
            ports,
            publish_http: self.publish_http,
            publish_console: self.publish_console,
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            events: events_tx,
            running: AtomicBool::new(true),
        });

        for listener in listeners {
            tokio::spawn(accept_loop(listener, Arc::clone(&state), shutdown_tx.subscribe()));
        }

        info!("Debugger listening on {}", state.ws_url());
        state.print_ready_message("listening");

        let guard = Arc::new(ServerGuard { state: Arc::clone(&state), shutdown_tx });
        let handle = ServerHandle { state, guard, local_addrs: local_addrs.into() };
        Ok(InspectorServer { handle, events })
    }
}

/// Listen on every address `host` resolves to, failing only if none binds.
///
/// With port 0 the first listener picks the port and the others reuse it.
async fn bind_all(host: &str, port: u16) -> Result<Vec<TcpListener>> {
    let mut port = port;
    let mut listeners = Vec::new();
    let mut last_error = None;

    for resolved in lookup_host((host, port)).await? {
        let addr = SocketAddr::new(resolved.ip(), port);
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                port = listener.local_addr()?.port();
                debug!(%addr, "Inspector listener bound");
                listeners.push(listener);
            }
            Err(err) => {
                warn!(%addr, "Failed to listen: {}", err);
                last_error = Some(err);
            }
        }
    }

    if listeners.is_empty() {
        return Err(match last_error {
            Some(err) => eyre!("Failed to listen on {}: {}", format_host_port(host, port), err),
            None => eyre!("{host} did not resolve to any address"),
        });
    }
    Ok(listeners)
}

/// A running inspector server and the stream of its session events
#[derive(Debug)]
pub struct InspectorServer {
    handle: ServerHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl InspectorServer {
    /// Start configuring a server
    pub fn builder() -> InspectorServerBuilder {
        InspectorServerBuilder::new()
    }

    /// Handle for controlling the server
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Wait for the next session event.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Split into the control handle and the event receiver
    pub fn into_parts(self) -> (ServerHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        (self.handle, self.events)
    }
}

/// Cloneable control surface of a running server
#[derive(Debug, Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
    guard: Arc<ServerGuard>,
    local_addrs: Arc<[SocketAddr]>,
}

impl ServerHandle {
    /// Address of the first listener
    pub fn local_addr(&self) -> SocketAddr {
        // Never empty, `start` fails when nothing binds
        self.local_addrs[0]
    }

    /// Addresses of all listeners, one per resolved host address
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Id of the debuggable target
    pub fn target_id(&self) -> &str {
        &self.state.target.id
    }

    /// `ws://` URL front-ends connect to
    pub fn ws_url(&self) -> String {
        self.state.ws_url()
    }

    /// Send a protocol message to an attached session.
    ///
    /// Returns `false` if no such session is attached.
    pub fn send(&self, session_id: u64, message: impl Into<String>) -> bool {
        let message: String = message.into();
        let connections = self.state.connections.lock();
        match connections.get(&session_id) {
            Some(tracked) if tracked.attached => {
                tracked.handle.write(message.into_bytes());
                true
            }
            _ => {
                debug!(session_id, "Dropping message for unknown session");
                false
            }
        }
    }

    /// Number of attached sessions
    pub fn session_count(&self) -> usize {
        self.state.attached_count()
    }

    /// Stop accepting new connections; existing ones keep running.
    pub fn stop(&self) {
        self.guard.stop();
    }

    /// Close every connection and stop accepting new ones.
    pub fn terminate(&self) {
        self.state.shutdown_connections();
        self.guard.stop();
    }
}

/// Owns the stop signal; the accept loops only hold receivers, so they end
/// once the last handle is gone.
#[derive(Debug)]
struct ServerGuard {
    state: Arc<ServerState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ServerGuard {
    fn stop(&self) {
        self.state.running.store(false, Ordering::Relaxed);
        if self.shutdown_tx.send(()).is_err() {
            debug!("Inspector listeners already stopped");
        }
    }
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        debug!("Last inspector server handle dropped");
        self.state.shutdown_connections();
        self.stop();
    }
}

#[derive(Debug)]
struct Tracked {
    handle: ConnectionHandle,
    attached: bool,
}

#[derive(Debug)]
struct ServerState {
    target: Target,
    version: VersionInfo,
    host: String,
    ports: Vec<u16>,
    publish_http: bool,
    publish_console: bool,
    connections: Mutex<HashMap<u64, Tracked>>,
    next_connection_id: AtomicU64,
    events: mpsc::UnboundedSender<SessionEvent>,
    running: AtomicBool,
}

impl ServerState {
    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session event receiver dropped");
        }
    }

    /// Port of the first listener
    fn port(&self) -> u16 {
        self.ports.first().copied().unwrap_or_default()
    }

    fn ws_url(&self) -> String {
        format_ws_address(&self.host, self.port(), &self.target.id, true)
    }

    fn attached_count(&self) -> usize {
        self.connections.lock().values().filter(|tracked| tracked.attached).count()
    }

    fn shutdown_connections(&self) {
        for tracked in self.connections.lock().values() {
            tracked.handle.shutdown();
        }
    }

    fn print_ready_message(&self, verb: &str) {
        if self.publish_console {
            eprint!("{}", ready_message(verb, &self.host, &self.ports, &self.target.id));
        }
    }
}

/// `Debugger <verb> on <ws url>` for every listening port
fn ready_message(verb: &str, host: &str, ports: &[u16], target_id: &str) -> String {
    ports
        .iter()
        .map(|port| format!("Debugger {verb} on {}\n", format_ws_address(host, *port, target_id, true)))
        .collect()
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = state.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    debug!(%peer, connection_id = id, "Accepted inspector connection");

                    let delegate = SessionDelegate { state: Arc::clone(&state), id, attached: false };
                    let connection = Connection::from_tcp(stream, delegate);
                    state
                        .connections
                        .lock()
                        .insert(id, Tracked { handle: connection.handle(), attached: false });

                    tokio::spawn(async move {
                        if let Err(err) = connection.run().await {
                            debug!(%peer, connection_id = id, "Connection ended: {}", err);
                        }
                    });
                }
                Err(err) => warn!("Failed to accept inspector connection: {}", err),
            }
        }
    }
    info!(addr = ?listener.local_addr().ok(), "Inspector listener stopped");
}

fn http_response(status: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.0 {status}\r\n\
         Content-Type: application/json; charset=UTF-8\r\n\
         Cache-Control: no-cache\r\n\
         Content-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

/// Per-connection glue between a [`Connection`] and the shared server state
struct SessionDelegate {
    state: Arc<ServerState>,
    id: u64,
    attached: bool,
}

impl SessionDelegate {
    fn list_response(&self, conn: &ConnectionHandle, host: &str) -> Result<String> {
        let host = if host.is_empty() {
            format_host_port(conn.peer_host(), self.state.port())
        } else {
            host.to_string()
        };
        Ok(serde_json::to_string_pretty(&[self.state.target.describe(&host)])?)
    }
}

/// Match `expected` as the leading path segment of `path`, case-insensitively,
/// returning what follows it.
fn match_path_segment<'a>(path: &'a str, expected: &str) -> Option<&'a str> {
    let head = path.get(..expected.len())?;
    if !head.eq_ignore_ascii_case(expected) {
        return None;
    }
    let rest = &path[expected.len()..];
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

impl ConnectionDelegate for SessionDelegate {
    fn on_http_get(&mut self, conn: &ConnectionHandle, host: &str, path: &str) {
        if !self.state.publish_http {
            debug!(path, "HTTP endpoints are not published");
            conn.write(http_response("404 Not Found", ""));
            return;
        }

        let body = match match_path_segment(path, "/json") {
            Some(command) if command.is_empty() || match_path_segment(command, "list").is_some() => {
                self.list_response(conn, host)
            }
            Some(command) if match_path_segment(command, "version").is_some() => {
                serde_json::to_string_pretty(&self.state.version).map_err(Into::into)
            }
            _ => {
                debug!(path, "No inspector endpoint for path");
                conn.cancel_handshake();
                return;
            }
        };
        match body {
            Ok(body) => conn.write(http_response("200 OK", &body)),
            Err(err) => {
                warn!("Failed to render inspector response: {}", err);
                conn.cancel_handshake();
            }
        }
    }

    fn on_socket_upgrade(&mut self, conn: &ConnectionHandle, _host: &str, path: &str, ws_key: &str) {
        let id = path.strip_prefix('/').unwrap_or(path);
        if self.attached || id != self.state.target.id {
            warn!(path, "Declining upgrade for unknown target");
            conn.cancel_handshake();
            return;
        }

        if let Some(tracked) = self.state.connections.lock().get_mut(&self.id) {
            tracked.attached = true;
        }
        self.attached = true;
        conn.accept_upgrade(ws_key);
        info!(session_id = self.id, "Debugger attached.");
        self.state.emit(SessionEvent::Started { session_id: self.id });
    }

    fn on_ws_frame(&mut self, _conn: &ConnectionHandle, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload).into_owned();
        self.state.emit(SessionEvent::Message { session_id: self.id, text });
    }

    fn on_closed(&mut self, _conn: &ConnectionHandle) {
        self.state.connections.lock().remove(&self.id);
        if !self.attached {
            return;
        }

        info!(session_id = self.id, "Debugger detached.");
        self.state.emit(SessionEvent::Ended { session_id: self.id });
        if self.state.running.load(Ordering::Relaxed) && self.state.attached_count() == 0 {
            info!("Debugger ending on {}", self.state.ws_url());
            self.state.print_ready_message("ending");
        }
    }
}

/// `name[pid]` of the current process
fn human_readable_process_name() -> String {
    let name = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|name| name.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "jsvm".to_string());
    format!("{}[{}]", name, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_path_segment() {
        assert_eq!(match_path_segment("/json", "/json"), Some(""));
        assert_eq!(match_path_segment("/JSON/list", "/json"), Some("list"));
        assert_eq!(match_path_segment("/json/version", "/json"), Some("version"));
        assert_eq!(match_path_segment("/jsonx", "/json"), None);
        assert_eq!(match_path_segment("/js", "/json"), None);
        assert_eq!(match_path_segment("list", "list"), Some(""));
    }

    #[test]
    fn test_process_name_has_pid() {
        let name = human_readable_process_name();
        assert!(name.ends_with(&format!("[{}]", std::process::id())));
    }

    #[test]
    fn test_builder_defaults() {
        let builder = InspectorServerBuilder::new();
        assert_eq!(builder.host, "127.0.0.1");
        assert_eq!(builder.port, DEFAULT_INSPECTOR_PORT);
        assert!(builder.target_id.is_none());
        assert!(builder.publish_http);
        assert!(builder.publish_console);
    }

    #[test]
    fn test_script_sets_title() {
        let builder = InspectorServerBuilder::new().script("does/not/exist.js");
        assert_eq!(builder.target_title.as_deref(), Some("does/not/exist.js"));
        assert!(builder.target_url.is_empty());
    }

    #[test]
    fn test_ready_message_lines() {
        assert_eq!(
            ready_message("listening", "127.0.0.1", &[9229], "abc"),
            "Debugger listening on ws://127.0.0.1:9229/abc\n"
        );
        assert_eq!(
            ready_message("ending", "::1", &[9229, 9230], "abc"),
            "Debugger ending on ws://[::1]:9229/abc\nDebugger ending on ws://[::1]:9230/abc\n"
        );
    }

    #[test]
    fn test_not_found_response() {
        let response = http_response("404 Not Found", "");
        assert_eq!(
            response,
            b"HTTP/1.0 404 Not Found\r\nContent-Type: application/json; charset=UTF-8\r\n\
Cache-Control: no-cache\r\nContent-Length: 0\r\n\r\n"
        );
    }
}

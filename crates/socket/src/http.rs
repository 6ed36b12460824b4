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

//! HTTP phase: parse requests until the front-end asks for a WebSocket
//!
//! Bytes are buffered until `httparse` reports a complete request. Completed
//! requests are collected first and only acted upon once the whole chunk has
//! been parsed, so a rejection never interrupts a parse half way.

use crate::{
    connection::{Action, Event},
    error::ConnectionError,
    handshake::{compute_accept_key, is_allowed_host},
};
use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

/// Response sent to every request that is not a valid inspector handshake.
pub const HANDSHAKE_FAILED_RESPONSE: &[u8] = b"HTTP/1.0 400 Bad Request\r\n\
Content-Type: text/html; charset=UTF-8\r\n\r\n\
WebSockets request was expected\r\n";

const MAX_HEADERS: usize = 64;

/// Upper bound on a buffered, still incomplete request (llhttp's default header limit)
const MAX_REQUEST_SIZE: usize = 16 * 1024;

/// Build the `101 Switching Protocols` response for a client key.
pub fn accept_upgrade_response(ws_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        compute_accept_key(ws_key)
    )
    .into_bytes()
}

/// Result of looking a header up by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderValue<'a> {
    /// Not sent
    Absent,
    /// Sent under a single spelling of the name
    Unique(&'a str),
    /// Sent under several spellings of the name, which makes the value ambiguous
    Duplicate,
}

#[derive(Debug, Clone)]
struct HeaderEntry {
    name: String,
    value: String,
    occurrences: usize,
}

impl HeaderEntry {
    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Headers of a single request, looked up case-insensitively
///
/// Repeats of a name with identical spelling are folded into one entry by
/// appending their values, so only case variants of a name are ambiguous.
#[derive(Debug, Default, Clone)]
pub struct HeaderTable {
    entries: Vec<HeaderEntry>,
}

impl HeaderTable {
    fn from_raw(headers: &[httparse::Header<'_>]) -> Result<Self, ConnectionError> {
        let mut table = Self::default();
        for header in headers {
            let value = std::str::from_utf8(header.value).map_err(|_| {
                ConnectionError::MalformedHttp(format!("non UTF-8 value for {}", header.name))
            })?;
            table.insert(header.name, value.trim());
        }
        Ok(table)
    }

    fn insert(&mut self, name: &str, value: &str) {
        match self.entries.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => {
                entry.value.push_str(value);
                entry.occurrences += 1;
            }
            None => self.entries.push(HeaderEntry {
                name: name.to_string(),
                value: value.to_string(),
                occurrences: 1,
            }),
        }
    }

    /// Look up `name`, reporting case-variant duplicates instead of picking one.
    pub fn get(&self, name: &str) -> HeaderValue<'_> {
        let mut found = HeaderValue::Absent;
        for entry in self.entries.iter().filter(|entry| entry.is(name)) {
            if found != HeaderValue::Absent {
                return HeaderValue::Duplicate;
            }
            found = HeaderValue::Unique(&entry.value);
        }
        found
    }

    /// How many times `name` was sent, under any spelling
    pub fn occurrences(&self, name: &str) -> usize {
        self.entries.iter().filter(|entry| entry.is(name)).map(|entry| entry.occurrences).sum()
    }

    fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry.is(name))
    }

    /// Whether any `name` header lists `token` in its comma-separated value.
    fn has_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|entry| entry.is(name))
            .flat_map(|entry| entry.value.split(','))
            .any(|part| part.trim().eq_ignore_ascii_case(token))
    }
}

/// Snapshot of one fully received request
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Request target
    pub path: String,
    /// `Connection: upgrade` together with an `Upgrade` header
    pub upgrade: bool,
    /// Whether the method was `GET`
    pub is_get: bool,
    /// `Sec-WebSocket-Key`, empty when absent or ambiguous
    pub ws_key: String,
    /// `Host`, empty when absent
    pub host: String,
    /// `Host` was sent more than once
    pub host_ambiguous: bool,
}

impl PendingRequest {
    fn from_parts(method: &str, path: &str, headers: &HeaderTable) -> Self {
        let ws_key = match headers.get("Sec-WebSocket-Key") {
            HeaderValue::Unique(key) => key.to_string(),
            _ => String::new(),
        };
        let (host, host_ambiguous) = match headers.get("Host") {
            HeaderValue::Absent => (String::new(), false),
            HeaderValue::Unique(host) => (host.to_string(), false),
            HeaderValue::Duplicate => (String::new(), true),
        };
        Self {
            path: path.to_string(),
            upgrade: headers.contains("Upgrade") && headers.has_token("Connection", "upgrade"),
            is_get: method == "GET",
            ws_key,
            host,
            host_ambiguous,
        }
    }

    fn host_allowed(&self) -> bool {
        !self.host_ambiguous && is_allowed_host(&self.host)
    }
}

/// Try to parse one request from the front of `buf`.
///
/// Returns `Ok(None)` while the request (including any `Content-Length`
/// body) is still incomplete.
pub fn parse_request(buf: &[u8]) -> Result<Option<(PendingRequest, usize)>, ConnectionError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let header_len = match req.parse(buf)? {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };

    let table = HeaderTable::from_raw(req.headers)?;
    if table.contains("Transfer-Encoding") {
        return Err(ConnectionError::MalformedHttp("chunked request bodies are not accepted".into()));
    }
    if table.occurrences("Content-Length") > 1 {
        return Err(ConnectionError::MalformedHttp("duplicate Content-Length".into()));
    }
    let body_len = match table.get("Content-Length") {
        HeaderValue::Unique(len) => len.parse::<usize>().map_err(|_| {
            ConnectionError::MalformedHttp(format!("invalid Content-Length {len:?}"))
        })?,
        HeaderValue::Absent | HeaderValue::Duplicate => 0,
    };
    if buf.len() - header_len < body_len {
        return Ok(None);
    }

    let request =
        PendingRequest::from_parts(req.method.unwrap_or_default(), req.path.unwrap_or_default(), &table);
    Ok(Some((request, header_len + body_len)))
}

/// Handler for the HTTP phase of a connection
#[derive(Debug, Default)]
pub struct HttpPhase {
    buffer: BytesMut,
    rejected: bool,
}

impl HttpPhase {
    /// Create a handler with an empty inbound buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly received bytes, returning what the connection must do.
    pub fn on_data(&mut self, data: &[u8]) -> Vec<Action> {
        if self.rejected {
            return Vec::new();
        }
        self.buffer.extend_from_slice(data);

        let mut completed = Vec::new();
        let mut parse_error = None;
        loop {
            match parse_request(&self.buffer) {
                Ok(Some((request, consumed))) => {
                    debug!(path = %request.path, upgrade = request.upgrade, "HTTP request received");
                    self.buffer.advance(consumed);
                    let upgrade = request.upgrade;
                    completed.push(request);
                    if upgrade {
                        // Nothing past an upgrade request belongs to HTTP
                        self.buffer.clear();
                        break;
                    }
                    if self.buffer.is_empty() {
                        break;
                    }
                }
                Ok(None) => {
                    if self.buffer.len() > MAX_REQUEST_SIZE {
                        parse_error = Some(ConnectionError::MalformedHttp(format!(
                            "request exceeds {MAX_REQUEST_SIZE} bytes"
                        )));
                    }
                    break;
                }
                Err(err) => {
                    parse_error = Some(err);
                    break;
                }
            }
        }

        let mut actions = Vec::with_capacity(completed.len() + 1);
        for request in completed {
            if !request.host_allowed() || !request.is_get {
                warn!(host = %request.host, get = request.is_get, "Rejecting inspector request");
                actions.push(self.reject(ConnectionError::HandshakeRejected(
                    "disallowed host or method",
                )));
                return actions;
            }
            if !request.upgrade {
                actions.push(Action::Emit(Event::HttpGet { host: request.host, path: request.path }));
            } else if request.ws_key.is_empty() {
                warn!(path = %request.path, "Upgrade request without a usable Sec-WebSocket-Key");
                actions.push(self.reject(ConnectionError::HandshakeRejected(
                    "missing Sec-WebSocket-Key",
                )));
                return actions;
            } else {
                actions.push(Action::Emit(Event::Upgrade {
                    host: request.host,
                    path: request.path,
                    ws_key: request.ws_key,
                }));
            }
        }

        if let Some(err) = parse_error {
            warn!("Malformed HTTP input: {}", err);
            actions.push(self.reject(err));
        }
        actions
    }

    /// Answer with `400 Bad Request` and close once written.
    pub fn reject(&mut self, reason: ConnectionError) -> Action {
        self.rejected = true;
        self.buffer.clear();
        Action::WriteThenClose(HANDSHAKE_FAILED_RESPONSE.to_vec(), Some(reason))
    }
}

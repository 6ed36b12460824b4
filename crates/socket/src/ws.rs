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

//! WebSocket phase: frame delivery and the close handshake

use crate::{
    connection::{Action, Event},
    error::ConnectionError,
    frame::{decode_frame, encode_frame, FrameDecode, CLOSE_FRAME},
};
use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

/// Close handshake progress of an upgraded connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseState {
    /// Frames flow in both directions
    Open,
    /// We sent a close frame and wait for the peer's reply
    LocalInitiatedClose,
    /// The peer sent a close frame; ours is being written back
    RemoteInitiatedClose,
    /// Nothing more will be read or written
    Closed,
}

/// Handler for the WebSocket phase of a connection
#[derive(Debug)]
pub struct WsPhase {
    buffer: BytesMut,
    state: CloseState,
}

impl Default for WsPhase {
    fn default() -> Self {
        Self { buffer: BytesMut::new(), state: CloseState::Open }
    }
}

impl WsPhase {
    /// Create a handler in the [`CloseState::Open`] state
    pub fn new() -> Self {
        Self::default()
    }

    /// Current close handshake state
    pub fn state(&self) -> CloseState {
        self.state
    }

    /// Feed newly received bytes, returning what the connection must do.
    ///
    /// Frames are decoded until the buffer runs dry or holds only part of a
    /// frame. A close frame or a protocol violation ends processing.
    pub fn on_data(&mut self, data: &[u8]) -> Vec<Action> {
        if matches!(self.state, CloseState::RemoteInitiatedClose | CloseState::Closed) {
            return Vec::new();
        }
        self.buffer.extend_from_slice(data);

        let mut actions = Vec::new();
        while !self.buffer.is_empty() {
            let decoded = decode_frame(&self.buffer, true);
            if decoded.compressed {
                warn!("Peer sent a compressed frame without negotiating an extension");
                actions.push(self.violation("compressed frame"));
                break;
            }
            match decoded.result {
                FrameDecode::Ok { payload, consumed } => {
                    debug!(len = payload.len(), "WebSocket frame received");
                    self.buffer.advance(consumed);
                    actions.push(Action::Emit(Event::Frame(payload)));
                }
                FrameDecode::Close { consumed } => {
                    self.buffer.advance(consumed);
                    actions.push(self.on_close_frame());
                    break;
                }
                FrameDecode::Incomplete => break,
                FrameDecode::Error => {
                    warn!("Malformed or unsupported WebSocket frame");
                    actions.push(self.violation("malformed or unsupported frame"));
                    break;
                }
            }
        }
        actions
    }

    fn on_close_frame(&mut self) -> Action {
        match self.state {
            CloseState::Open => {
                debug!("Peer initiated close, echoing close frame");
                self.state = CloseState::RemoteInitiatedClose;
                Action::WriteThenClose(CLOSE_FRAME.to_vec(), None)
            }
            CloseState::LocalInitiatedClose => {
                debug!("Peer acknowledged our close frame");
                self.state = CloseState::Closed;
                Action::Close(None)
            }
            CloseState::RemoteInitiatedClose | CloseState::Closed => Action::Close(None),
        }
    }

    fn violation(&mut self, reason: &'static str) -> Action {
        self.state = CloseState::Closed;
        self.buffer.clear();
        Action::Close(Some(ConnectionError::ProtocolViolation(reason)))
    }

    /// Start a locally initiated close.
    pub fn shutdown(&mut self) -> Vec<Action> {
        match self.state {
            CloseState::Open => {
                self.state = CloseState::LocalInitiatedClose;
                vec![Action::Write(CLOSE_FRAME.to_vec())]
            }
            CloseState::LocalInitiatedClose | CloseState::RemoteInitiatedClose => Vec::new(),
            CloseState::Closed => vec![Action::Close(None)],
        }
    }

    /// Frame `payload` for the wire; `None` once closed.
    pub fn write(&self, payload: &[u8]) -> Option<Vec<u8>> {
        (self.state != CloseState::Closed).then(|| encode_frame(payload))
    }

    /// The transport reported end of stream or failed.
    pub fn on_eof(&mut self) {
        if self.state != CloseState::Closed {
            debug!(state = ?self.state, "WebSocket transport closed");
        }
        self.state = CloseState::Closed;
        self.buffer.clear();
    }

    /// Our final close frame reached the wire.
    pub fn on_close_written(&mut self) {
        debug_assert_eq!(self.state, CloseState::RemoteInitiatedClose);
        self.state = CloseState::Closed;
    }
}

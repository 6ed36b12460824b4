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

//! Error types for the inspector connection layer
//!
//! None of these ever reach the [`ConnectionDelegate`](crate::ConnectionDelegate):
//! every failure tears the connection down and the delegate only observes that
//! no further events arrive. They exist so the owner of the connection task can
//! log why a connection ended.

use thiserror::Error;

/// Why a connection ended abnormally
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Socket read or write failure
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The HTTP request could not be parsed
    #[error("malformed HTTP request: {0}")]
    MalformedHttp(String),

    /// The request was answered with `400 Bad Request`
    #[error("handshake rejected: {0}")]
    HandshakeRejected(&'static str),

    /// The peer sent a frame outside the supported WebSocket subset
    #[error("WebSocket protocol violation: {0}")]
    ProtocolViolation(&'static str),
}

impl From<httparse::Error> for ConnectionError {
    fn from(err: httparse::Error) -> Self {
        Self::MalformedHttp(err.to_string())
    }
}

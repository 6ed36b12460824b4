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

//! Inspector Socket - the debug-protocol connection layer
//!
//! Accepts a raw TCP connection from a debugger front-end, answers its HTTP
//! requests, upgrades it to a WebSocket on request and then exchanges text
//! frames until either side closes.
//!
//! The building blocks, leaves first:
//! - [`frame`]: WebSocket frame encoding and decoding
//! - [`handshake`]: Host header validation and accept key derivation
//! - [`http`] / [`ws`]: sans-IO handlers for the two protocol phases
//! - [`connection`]: the task that owns the socket and the active phase
//! - [`server`]: a listener that exposes one debug target to front-ends

pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod http;
pub mod server;
pub mod ws;

pub use connection::{Connection, ConnectionDelegate, ConnectionHandle, ConnectionPhase, Event};
pub use error::ConnectionError;
pub use server::{InspectorServer, InspectorServerBuilder, ServerHandle, SessionEvent};

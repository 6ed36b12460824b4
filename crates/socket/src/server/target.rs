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

//! Debug target metadata served on the `/json` endpoints

use serde::{Deserialize, Serialize};

/// Generate a random target id in UUID version 4 text form.
pub fn generate_id() -> String {
    let buffer: [u16; 8] = rand::random();
    format!(
        "{:04x}{:04x}-{:04x}-{:04x}-{:04x}-{:04x}{:04x}{:04x}",
        buffer[0],
        buffer[1],
        buffer[2],
        (buffer[3] & 0x0fff) | 0x4000,
        (buffer[4] & 0x3fff) | 0x8000,
        buffer[5],
        buffer[6],
        buffer[7],
    )
}

/// `host:port`, bracketing bare IPv6 addresses.
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// `<host>/<target_id>`, prefixed with `ws://` when `include_protocol` is set.
pub fn format_address(host: &str, target_id: &str, include_protocol: bool) -> String {
    let scheme = if include_protocol { "ws://" } else { "" };
    format!("{scheme}{host}/{target_id}")
}

/// WebSocket address of a target on `host:port`.
pub fn format_ws_address(host: &str, port: u16, target_id: &str, include_protocol: bool) -> String {
    format_address(&format_host_port(host, port), target_id, include_protocol)
}

/// DevTools front-end URL that connects to `address` (given without scheme).
pub fn frontend_url(compat: bool, address: &str) -> String {
    let app = if compat { "inspector" } else { "js_app" };
    format!("devtools://devtools/bundled/{app}.html?v8only=true&ws={address}")
}

/// The single debuggable target exposed by a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Target id, also the upgrade path
    pub id: String,
    /// Human readable title
    pub title: String,
    /// Best effort URL of the script being debugged
    pub url: String,
}

impl Target {
    /// Describe the target for a client that reached us through `host`
    /// (a `Host` header value, port included).
    pub fn describe(&self, host: &str) -> TargetDescription {
        let address = format_address(host, &self.id, false);
        TargetDescription {
            description: "jsvm instance".to_string(),
            devtools_frontend_url: frontend_url(false, &address),
            devtools_frontend_url_compat: frontend_url(true, &address),
            id: self.id.clone(),
            title: self.title.clone(),
            kind: "node".to_string(),
            url: self.url.clone(),
            web_socket_debugger_url: format_address(host, &self.id, true),
        }
    }
}

/// One entry of the `/json/list` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDescription {
    /// Free-form description
    pub description: String,
    /// Front-end URL for current DevTools
    pub devtools_frontend_url: String,
    /// Front-end URL for older DevTools
    pub devtools_frontend_url_compat: String,
    /// Target id
    pub id: String,
    /// Target title
    pub title: String,
    /// Target type as understood by front-ends
    #[serde(rename = "type")]
    pub kind: String,
    /// Script URL
    pub url: String,
    /// Address to upgrade against
    pub web_socket_debugger_url: String,
}

/// The `/json/version` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Runtime name and version
    #[serde(rename = "Browser")]
    pub browser: String,
    /// DevTools protocol version
    #[serde(rename = "Protocol-Version")]
    pub protocol_version: String,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            browser: concat!("inspector-socket/", env!("CARGO_PKG_VERSION")).to_string(),
            protocol_version: "1.1".to_string(),
        }
    }
}

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

//! Handshake validation: Host header checks and `Sec-WebSocket-Accept` derivation
//!
//! The Host check is the anti DNS-rebinding control of the inspector. Only
//! `localhost` and unambiguous, routable IP literals are trusted. Any other
//! name is rejected even if it currently resolves to loopback, since a
//! resolution can change between checks.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use std::net::{Ipv4Addr, Ipv6Addr};

/// GUID appended to the client key when computing the accept key (RFC 6455)
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximum textual length of an IPv6 address, including the terminating NUL
/// that the C representation reserves (`INET6_ADDRSTRLEN`).
const INET6_ADDRSTRLEN: usize = 46;

/// Maximum textual length of an IPv4 address, terminating NUL included.
const INET_ADDRSTRLEN: usize = 16;

/// Compute the `Sec-WebSocket-Accept` value for a client's `Sec-WebSocket-Key`.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Whether a `Host` header value (optionally with `:port`) may talk to the inspector.
///
/// An empty host is allowed since HTTP/1.0 clients may not send one.
pub fn is_allowed_host(host_with_port: &str) -> bool {
    let host = trim_port(host_with_port);
    host.is_empty() || is_ip_address(host) || host.eq_ignore_ascii_case("localhost")
}

/// Drop a trailing `:port`, leaving colons inside `[...]` alone.
fn trim_port(host: &str) -> &str {
    let Some(last_colon) = host.rfind(':') else {
        return host;
    };
    match host.rfind(']') {
        Some(bracket) if last_colon < bracket => host,
        _ => &host[..last_colon],
    }
}

fn is_ip_address(host: &str) -> bool {
    if host.contains('\0') {
        return false;
    }

    // IPv6 literals must be bracketed, and anything bracketed must be IPv6.
    if host.len() >= 4 && host.starts_with('[') && host.ends_with(']') {
        let inner = &host[1..host.len() - 1];
        if inner.len() >= INET6_ADDRSTRLEN || inner.contains('%') {
            return false;
        }
        return match inner.parse::<Ipv6Addr>() {
            // `::` is the only non-routable IPv6 address
            Ok(addr) => !addr.is_unspecified(),
            Err(_) => false,
        };
    }

    if host.len() + 1 > INET_ADDRSTRLEN {
        return false;
    }
    // `Ipv4Addr` only accepts strict dotted decimal: no octal, hex or short forms.
    match host.parse::<Ipv4Addr>() {
        // 0.0.0.0/8 is not routable
        Ok(addr) => addr.octets()[0] != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc_vector() {
        assert_eq!(compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_accept_key_length() {
        assert_eq!(compute_accept_key("x3JJHMbDL1EzLkh9GBhXDw==").len(), 28);
    }

    #[test]
    fn test_allowed_hosts() {
        for host in ["", "localhost", "LOCALHOST", "127.0.0.1", "[::1]", "localhost:9229"] {
            assert!(is_allowed_host(host), "{host:?} should be allowed");
        }
        for host in ["127.0.0.1:9229", "[::1]:9229", "192.168.0.10", "[fe80::1]"] {
            assert!(is_allowed_host(host), "{host:?} should be allowed");
        }
    }

    #[test]
    fn test_rejected_hosts() {
        for host in [
            "0.0.0.0",
            "0.1.2.3",
            "[::]",
            "[::]:9229",
            "evil.example.com",
            "127.0.0.1\0x",
            "localhost\0",
            "localhost.evil.com",
        ] {
            assert!(!is_allowed_host(host), "{host:?} should be rejected");
        }
    }

    #[test]
    fn test_ambiguous_ip_forms_are_rejected() {
        for host in ["0177.0.0.1", "0x7f.0.0.1", "2130706433", "127.1", "127.0.0.01"] {
            assert!(!is_allowed_host(host), "{host:?} should be rejected");
        }
    }

    #[test]
    fn test_malformed_ipv6_is_rejected() {
        for host in ["[::1%eth0]", "[not-an-ip]", "[]", "::1", "[1:2:3:4:5:6:7:8:9]"] {
            assert!(!is_allowed_host(host), "{host:?} should be rejected");
        }
    }

    #[test]
    fn test_trim_port() {
        assert_eq!(trim_port("localhost:9229"), "localhost");
        assert_eq!(trim_port("[::1]"), "[::1]");
        assert_eq!(trim_port("[::1]:80"), "[::1]");
        assert_eq!(trim_port("127.0.0.1"), "127.0.0.1");
    }
}

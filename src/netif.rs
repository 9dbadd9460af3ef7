// Copyright 2026 The dhcpd Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Local interface discovery.
//!
//! Broadcasting needs the host's own IPv4 addresses to bind per-interface
//! sockets and to fill the server identifier option. Deployments with more
//! than one interface should list them explicitly via the
//! `server_identifiers` configuration field; this probe only discovers the
//! address of the default route.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

/// Returns this host's IPv4 addresses, best effort.
///
/// The probe connects a UDP socket (no datagram is sent) and reads the
/// source address the kernel picked. Falls back to loopback so the server
/// can still run on an isolated machine.
pub fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    match probe_default_route() {
        Some(addr) => vec![addr],
        None => vec![Ipv4Addr::LOCALHOST],
    }
}

fn probe_default_route() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 53)).ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Some(*addr.ip()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ipv4_addresses_is_never_empty() {
        assert!(!local_ipv4_addresses().is_empty());
    }
}

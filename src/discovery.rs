//! Discovery source helpers (component N, SPEC_FULL §4.3a): local IP detection, CIDR expansion,
//! and host probing for Registry::discover. Pure/best-effort — never the only way to add a node.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use tracing::debug;

/// Best-effort local IPv4 address: opens a UDP "connection" to a well-known external address
/// (no packet is actually sent) and reads back the local socket address the OS chose as the
/// outbound route, falling back to hostname resolution if that fails.
pub fn local_ip() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    if socket.connect("8.8.8.8:80").is_ok() {
        if let Ok(SocketAddr::V4(addr)) = socket.local_addr() {
            return Some(*addr.ip());
        }
    }

    let hostname = hostname_guess()?;
    match dns_lookup_first_v4(&hostname) {
        Some(ip) if ip != Ipv4Addr::LOCALHOST => Some(ip),
        _ => None,
    }
}

fn hostname_guess() -> Option<String> {
    std::env::var("HOSTNAME").ok().or_else(|| {
        std::process::Command::new("hostname")
            .output()
            .ok()
            .and_then(|out| String::from_utf8(out.stdout).ok())
            .map(|s| s.trim().to_string())
    })
}

fn dns_lookup_first_v4(host: &str) -> Option<Ipv4Addr> {
    use std::net::ToSocketAddrs;
    (host, 0u16)
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
}

/// Containing CIDR block for `ip` at `prefix_len` (default /24, matching the 255.255.255.0
/// netmask the source assumes for home/office networks).
pub fn network_cidr(ip: Ipv4Addr, prefix_len: u8) -> String {
    let mask: u32 = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    };
    let network = u32::from(ip) & mask;
    format!("{}/{}", Ipv4Addr::from(network), prefix_len)
}

/// Best-guess CIDR for the local network, used when `discover` is invoked without an explicit
/// range.
pub fn detect_local_network() -> Option<String> {
    let ip = local_ip()?;
    debug!(%ip, "detected local ip for discovery");
    Some(network_cidr(ip, 24))
}

/// Candidate CIDR ranges to sweep when the caller gives `discover` no explicit range. Currently
/// just the single best guess from `detect_local_network`; a future version could also walk
/// `/proc/net/route` or enumerate additional local interfaces.
pub fn suggest_scan_ranges() -> Vec<String> {
    detect_local_network().into_iter().collect()
}

/// All host addresses in `cidr` (excluding network/broadcast for anything wider than /31),
/// ordered. `cidr` must be an IPv4 CIDR string (`a.b.c.d/n`).
pub fn expand_cidr(cidr: &str) -> anyhow::Result<Vec<Ipv4Addr>> {
    let (addr_part, prefix_part) = cidr
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("invalid CIDR '{cidr}': missing prefix length"))?;
    let base: Ipv4Addr = addr_part.parse()?;
    let prefix_len: u32 = prefix_part.parse()?;
    if prefix_len > 32 {
        anyhow::bail!("invalid CIDR '{cidr}': prefix length out of range");
    }

    let host_bits = 32 - prefix_len;
    let mask: u32 = if prefix_len == 0 { 0 } else { u32::MAX << host_bits };
    let network = u32::from(base) & mask;
    let host_count = if host_bits == 0 { 1u32 } else { 1u32 << host_bits };

    if host_bits <= 1 {
        return Ok((0..host_count).map(|i| Ipv4Addr::from(network + i)).collect());
    }

    // Exclude network and broadcast addresses for any block wider than a /31.
    Ok((1..host_count - 1)
        .map(|i| Ipv4Addr::from(network + i))
        .collect())
}

/// TCP-connect probe used as the first, cheap filter before an `/api/tags` health probe.
pub async fn tcp_probe(ip: Ipv4Addr, port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::new(IpAddr::V4(ip), port);
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_cidr_masks_to_slash_24() {
        let ip: Ipv4Addr = "192.168.1.137".parse().unwrap();
        assert_eq!(network_cidr(ip, 24), "192.168.1.0/24");
    }

    #[test]
    fn expand_cidr_slash_30_yields_two_usable_hosts() {
        let hosts = expand_cidr("10.255.255.0/30").unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].to_string(), "10.255.255.1");
        assert_eq!(hosts[1].to_string(), "10.255.255.2");
    }

    #[test]
    fn expand_cidr_slash_31_yields_both_addresses() {
        let hosts = expand_cidr("10.0.0.0/31").unwrap();
        assert_eq!(hosts.len(), 2);
    }

    #[test]
    fn expand_cidr_rejects_malformed_input() {
        assert!(expand_cidr("not-a-cidr").is_err());
    }

    #[test]
    fn suggest_scan_ranges_falls_back_to_single_local_guess() {
        let ranges = suggest_scan_ranges();
        assert!(ranges.len() <= 1);
        if let Some(range) = ranges.first() {
            assert!(range.contains('/'));
        }
    }

    #[tokio::test]
    async fn tcp_probe_fails_fast_on_closed_port() {
        let ip: Ipv4Addr = "127.0.0.1".parse().unwrap();
        // Port 1 is reserved and essentially never listening in test environments.
        let ok = tcp_probe(ip, 1, Duration::from_millis(100)).await;
        assert!(!ok);
    }
}

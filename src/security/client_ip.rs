//! Client identity resolution behind reverse proxies.
//!
//! `X-Forwarded-For` is attacker-controlled unless the immediate peer is a
//! proxy we operate. The header is honored only when the peer address falls
//! inside a configured trusted range; a header arriving from anywhere else is
//! ignored and reported as suspected spoofing.

use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;
use serde::Serialize;
use tracing::warn;

/// Parsed set of trusted proxy ranges
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    ranges: Vec<IpNet>,
}

impl TrustedProxies {
    /// Parse CIDR strings. Malformed entries are logged and skipped; a bare
    /// address is treated as a single-host range.
    pub fn parse<S: AsRef<str>>(cidrs: &[S]) -> Self {
        let ranges = cidrs
            .iter()
            .filter_map(|raw| {
                let raw = raw.as_ref().trim();
                let parsed = raw
                    .parse::<IpNet>()
                    .or_else(|_| raw.parse::<IpAddr>().map(IpNet::from));
                match parsed {
                    Ok(net) => Some(net.trunc()),
                    Err(_) => {
                        warn!(entry = raw, "Skipping malformed trusted proxy range");
                        None
                    }
                }
            })
            .collect();
        Self { ranges }
    }

    /// True if `ip` is inside any trusted range
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.ranges.iter().any(|net| net.contains(&ip))
    }

    /// Number of valid ranges
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// True if no valid ranges were configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Who a request is attributed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientIdentity {
    /// Resolved client address (or the raw peer string if it did not parse)
    pub ip: String,
    /// True when `ip` came from a forwarded header relayed by a trusted proxy
    pub from_trusted_proxy: bool,
    /// Forwarded header sent by an untrusted peer, kept for reporting
    pub spoofed_header: Option<String>,
}

impl ClientIdentity {
    /// True if an untrusted peer tried to supply a forwarded address
    #[must_use]
    pub fn spoofing_suspected(&self) -> bool {
        self.spoofed_header.is_some()
    }
}

/// Resolve the client identity for one request.
///
/// `peer_address` is the transport-level peer, with or without a port.
/// `forwarded_for` is the raw `X-Forwarded-For` value, if any.
#[must_use]
pub fn resolve(
    peer_address: &str,
    forwarded_for: Option<&str>,
    trusted: &TrustedProxies,
) -> ClientIdentity {
    let forwarded = forwarded_for.map(str::trim).filter(|h| !h.is_empty());
    let peer_ip = parse_peer(peer_address);
    let peer = peer_ip.map_or_else(|| peer_address.to_string(), |ip| ip.to_string());
    let trusted_peer = peer_ip.is_some_and(|ip| trusted.contains(ip));

    match forwarded {
        None => ClientIdentity {
            ip: peer,
            from_trusted_proxy: false,
            spoofed_header: None,
        },
        Some(header) if trusted_peer => {
            // Left-most entry is the original client in a standard chain
            let client = header.split(',').next().unwrap_or_default().trim();
            if client.is_empty() {
                ClientIdentity {
                    ip: peer,
                    from_trusted_proxy: false,
                    spoofed_header: None,
                }
            } else {
                ClientIdentity {
                    ip: client.to_string(),
                    from_trusted_proxy: true,
                    spoofed_header: None,
                }
            }
        }
        Some(header) => ClientIdentity {
            ip: peer,
            from_trusted_proxy: false,
            spoofed_header: Some(header.to_string()),
        },
    }
}

/// Bare IP of a peer address: `ip`, `ip:port`, `[v6]` or `[v6]:port`.
fn parse_peer(addr: &str) -> Option<IpAddr> {
    let addr = addr.trim();
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return Some(sock.ip().to_canonical());
    }
    let bare = addr
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(addr);
    bare.parse::<IpAddr>().ok().map(|ip| ip.to_canonical())
}

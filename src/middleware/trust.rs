//! Trust resolution for forwarded-address headers.
//!
//! `X-Forwarded-For` and `X-Real-IP` are only meaningful when they were written
//! by infrastructure the operator controls. A peer is a *trusted relay* when its
//! address falls into one of the always-trusted private ranges, or matches an
//! entry of the operator-configured `TRUSTED_PROXIES` list.
//!
//! # Always-Trusted Ranges
//!
//! | Range            | Purpose                    |
//! |------------------|----------------------------|
//! | `127.0.0.0/8`    | IPv4 loopback              |
//! | `10.0.0.0/8`     | RFC 1918                   |
//! | `172.16.0.0/12`  | RFC 1918                   |
//! | `192.168.0.0/16` | RFC 1918                   |
//! | `::1/128`        | IPv6 loopback              |
//! | `fc00::/7`       | IPv6 unique local (RFC 4193) |
//!
//! # Reconfiguration
//!
//! The operator list lives behind an [`ArcSwap`]. Readers load an immutable
//! snapshot without locking; [`TrustResolver::reload`] builds a fresh snapshot
//! and swaps it in atomically. A request that already loaded a snapshot keeps
//! using it until it completes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info, warn};

// =============================================================================
// CIDR Matching
// =============================================================================

/// Parsed CIDR network range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    /// Network address
    network: IpAddr,
    /// Prefix length (e.g., 24 for /24)
    prefix_len: u8,
}

impl CidrRange {
    const fn v4(a: u8, b: u8, c: u8, d: u8, prefix_len: u8) -> Self {
        Self {
            network: IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
            prefix_len,
        }
    }

    const fn v6(network: Ipv6Addr, prefix_len: u8) -> Self {
        Self {
            network: IpAddr::V6(network),
            prefix_len,
        }
    }

    /// Parse CIDR notation (`"10.0.0.0/8"`, `"fd00::/8"`) or a single address,
    /// which is treated as `/32` or `/128`.
    ///
    /// Returns `None` if the format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();

        let Some((ip, prefix)) = cidr.split_once('/') else {
            let ip = cidr.parse::<IpAddr>().ok()?.to_canonical();
            return Some(Self {
                network: ip,
                prefix_len: max_prefix(&ip),
            });
        };

        let ip: IpAddr = ip.parse().ok()?;
        let prefix_len: u8 = prefix.parse().ok()?;

        if prefix_len > max_prefix(&ip) {
            return None;
        }

        // `::ffff:a.b.c.d/N` with N >= 96 is the IPv4 range `a.b.c.d/(N - 96)`.
        // Addresses are canonicalized before matching, so it must be stored that way.
        match ip.to_canonical() {
            canonical @ IpAddr::V4(_) if ip.is_ipv6() && prefix_len >= 96 => Some(Self {
                network: canonical,
                prefix_len: prefix_len - 96,
            }),
            _ => Some(Self {
                network: ip,
                prefix_len,
            }),
        }
    }

    /// Prefix length of this range.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check if an IP address is contained within this CIDR range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            // IPv4 and IPv6 don't match
            _ => false,
        }
    }
}

fn max_prefix(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Loopback, RFC 1918 and IPv6 unique-local ranges. Always trusted.
const PRIVATE_RANGES: [CidrRange; 6] = [
    CidrRange::v4(127, 0, 0, 0, 8),
    CidrRange::v4(10, 0, 0, 0, 8),
    CidrRange::v4(172, 16, 0, 0, 12),
    CidrRange::v4(192, 168, 0, 0, 16),
    CidrRange::v6(Ipv6Addr::LOCALHOST, 128),
    CidrRange::v6(Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
];

// =============================================================================
// Operator Configuration
// =============================================================================

/// Operator-configured trusted proxies (public reverse proxies, CDN edges).
///
/// This is one immutable snapshot. Use [`TrustResolver`] to share and swap it.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Build a snapshot from address or CIDR strings.
    ///
    /// Invalid entries are logged as warnings and skipped.
    pub fn new(entries: &[String]) -> Self {
        let ranges: Vec<CidrRange> = entries
            .iter()
            .filter_map(|entry| {
                let parsed = CidrRange::parse(entry);
                if parsed.is_none() {
                    warn!(entry = %entry, "Invalid address or CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy list configured");
        }

        Self { ranges }
    }

    /// Number of configured ranges (private ranges excluded).
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether the operator configured no additional proxies.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Check if an address is private or matches a configured proxy.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = ip.to_canonical();
        PRIVATE_RANGES
            .iter()
            .chain(self.ranges.iter())
            .any(|range| range.contains(&ip))
    }
}

// =============================================================================
// Shared Resolver
// =============================================================================

/// Shared, reloadable view of the trust configuration.
///
/// Cheap to query from many requests at once; wrap it in an `Arc` and hand a
/// clone to every stage that needs it.
#[derive(Debug)]
pub struct TrustResolver {
    proxies: ArcSwap<TrustedProxyConfig>,
}

impl TrustResolver {
    /// Create a resolver trusting private ranges plus `trusted_proxies`.
    pub fn new(trusted_proxies: &[String]) -> Self {
        Self {
            proxies: ArcSwap::from_pointee(TrustedProxyConfig::new(trusted_proxies)),
        }
    }

    /// Replace the operator list. In-flight readers keep their old snapshot.
    pub fn reload(&self, trusted_proxies: &[String]) {
        let next = TrustedProxyConfig::new(trusted_proxies);
        info!(count = next.len(), "Trusted proxy list reloaded");
        self.proxies.store(Arc::new(next));
    }

    /// Current snapshot of the operator list.
    pub fn snapshot(&self) -> Arc<TrustedProxyConfig> {
        self.proxies.load_full()
    }

    /// Whether `address` (a bare IP, no port) is a trusted relay.
    ///
    /// Unparseable input is never trusted.
    pub fn is_trusted_relay(&self, address: &str) -> bool {
        match address.trim().parse::<IpAddr>() {
            Ok(ip) => self.proxies.load().contains(&ip),
            Err(_) => false,
        }
    }
}

impl Default for TrustResolver {
    fn default() -> Self {
        Self::new(&[])
    }
}

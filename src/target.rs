//! Probe targets and the fixed-width address form the wire format
//! carries.
//!
//! Target specifications arrive as strings (numeric addresses or host
//! names), are resolved once at startup or on an explicit refresh, and
//! are kept sorted and deduplicated for the round scheduler.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use crate::configuration::FamilySelection;

/// An IP address split into two little-endian 64-bit halves, the form
/// the payload carries. IPv4 addresses occupy the low half only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeAddress {
    pub low: u64,
    pub high: u64,
    /// 4 or 6.
    pub version: u8,
}

impl From<IpAddr> for ProbeAddress {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                let low = u64::from_le_bytes([o[0], o[1], o[2], o[3], 0, 0, 0, 0]);
                ProbeAddress {
                    low,
                    high: 0,
                    version: 4,
                }
            }
            IpAddr::V6(v6) => {
                let o = v6.octets();
                let mut low_bytes = [0u8; 8];
                let mut high_bytes = [0u8; 8];
                low_bytes.copy_from_slice(&o[0..8]);
                high_bytes.copy_from_slice(&o[8..16]);
                ProbeAddress {
                    low: u64::from_le_bytes(low_bytes),
                    high: u64::from_le_bytes(high_bytes),
                    version: 6,
                }
            }
        }
    }
}

impl ProbeAddress {
    /// Reconstructs the standard address form.
    pub fn ip_addr(&self) -> IpAddr {
        match self.version {
            4 => {
                let b = self.low.to_le_bytes();
                IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
            }
            _ => {
                let mut octets = [0u8; 16];
                octets[0..8].copy_from_slice(&self.low.to_le_bytes());
                octets[8..16].copy_from_slice(&self.high.to_le_bytes());
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        }
    }
}

impl Ord for ProbeAddress {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.version, self.high, self.low).cmp(&(other.version, other.high, other.low))
    }
}

impl PartialOrd for ProbeAddress {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for ProbeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.ip_addr())
    }
}

/// One resolved probe destination.
#[derive(Debug, Clone)]
pub struct Target {
    pub addr: ProbeAddress,
    /// The host name that resolved to this address, if any.
    pub name: Option<String>,
    /// When the resolution producing this entry happened.
    pub resolved_at: Instant,
}

impl Target {
    /// Destination socket address for a given responder port.
    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.addr.ip_addr(), port)
    }
}

/// The sorted, deduplicated set of current targets.
#[derive(Debug, Clone, Default)]
pub struct TargetSet {
    targets: Vec<Target>,
}

impl TargetSet {
    /// Builds a set from resolved candidates: sorted by address,
    /// duplicates collapsed (the first name wins).
    pub fn from_candidates(mut candidates: Vec<Target>) -> Self {
        candidates.sort_by(|a, b| a.addr.cmp(&b.addr));
        candidates.dedup_by(|a, b| a.addr == b.addr);
        TargetSet {
            targets: candidates,
        }
    }

    /// Resolves the given specifications, filtered by family.
    ///
    /// Numeric addresses are parsed directly; anything else goes
    /// through the system resolver. Specifications that fail to
    /// resolve are logged and skipped rather than aborting the run.
    pub async fn resolve(specs: &[String], family: FamilySelection) -> Self {
        let resolved_at = Instant::now();
        let mut candidates = Vec::new();

        for spec in specs {
            if let Ok(addr) = spec.parse::<IpAddr>() {
                let probe: ProbeAddress = addr.into();
                if family.covers(probe.version) {
                    candidates.push(Target {
                        addr: probe,
                        name: None,
                        resolved_at,
                    });
                }
                continue;
            }

            // The resolver wants host:port; the port is irrelevant here.
            match tokio::net::lookup_host((spec.as_str(), 0)).await {
                Ok(addrs) => {
                    let before = candidates.len();
                    for sockaddr in addrs {
                        let probe: ProbeAddress = sockaddr.ip().into();
                        if family.covers(probe.version) {
                            candidates.push(Target {
                                addr: probe,
                                name: Some(spec.clone()),
                                resolved_at,
                            });
                        }
                    }
                    if candidates.len() == before {
                        log::warn!("'{}' resolved to no usable address", spec);
                    }
                }
                Err(e) => {
                    log::warn!("could not resolve '{}': {}", spec, e);
                }
            }
        }

        Self::from_candidates(candidates)
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Target> {
        self.targets.iter()
    }

    /// The subset belonging to one IP version, preserving order.
    pub fn family_subset(&self, ip_version: u8) -> TargetSet {
        TargetSet {
            targets: self
                .targets
                .iter()
                .filter(|t| t.addr.version == ip_version)
                .cloned()
                .collect(),
        }
    }

    /// Name for a given address, for report annotation.
    pub fn name_of(&self, addr: &ProbeAddress) -> Option<&str> {
        self.targets
            .iter()
            .find(|t| t.addr == *addr)
            .and_then(|t| t.name.as_deref())
    }
}

//! Immutable role configurations and their validation.
//!
//! The binaries parse command lines with clap and convert them into
//! these plain structs; nothing in the library re-reads arguments or
//! mutates configuration after startup.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::report::ReportFormat;

/// Default UDP port of the responder.
pub const DEFAULT_PORT: u16 = 7373;

/// Default socket buffer size in bytes, both directions.
pub const DEFAULT_BUFFER_SIZE: usize = 262_144;

/// Default outgoing TTL/Hop-Limit.
pub const DEFAULT_TTL: u8 = 64;

/// Configuration errors. Always fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("invalid address family '{0}' (expected 4, 6 or both)")]
    BadFamily(String),

    #[error("invalid pacing mode '{0}' (expected dispersed or grouped)")]
    BadPacing(String),

    #[error("at least one target is required")]
    NoTargets,

    #[error("round count must be non-zero")]
    ZeroRounds,

    #[error("round interval must be non-zero")]
    ZeroInterval,

    #[error("responder listens on a single address family, not both")]
    ResponderBothFamilies,
}

/// Which address families a role should serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilySelection {
    V4,
    V6,
    Both,
}

impl FamilySelection {
    /// True if the selection covers the given IP version (4 or 6).
    pub fn covers(self, ip_version: u8) -> bool {
        match self {
            FamilySelection::V4 => ip_version == 4,
            FamilySelection::V6 => ip_version == 6,
            FamilySelection::Both => ip_version == 4 || ip_version == 6,
        }
    }
}

impl FromStr for FamilySelection {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "4" | "v4" | "ipv4" => Ok(FamilySelection::V4),
            "6" | "v6" | "ipv6" => Ok(FamilySelection::V6),
            "both" | "any" => Ok(FamilySelection::Both),
            _ => Err(ConfigurationError::BadFamily(s.to_string())),
        }
    }
}

impl fmt::Display for FamilySelection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FamilySelection::V4 => write!(f, "4"),
            FamilySelection::V6 => write!(f, "6"),
            FamilySelection::Both => write!(f, "both"),
        }
    }
}

/// Requester pacing policy for spacing sends within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// One send per sub-interval, responses interleaved with sends.
    Dispersed,
    /// All sends back-to-back, then a single wait.
    Grouped,
}

impl FromStr for Pacing {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dispersed" | "d" => Ok(Pacing::Dispersed),
            "grouped" | "g" => Ok(Pacing::Grouped),
            _ => Err(ConfigurationError::BadPacing(s.to_string())),
        }
    }
}

impl fmt::Display for Pacing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Pacing::Dispersed => write!(f, "dispersed"),
            Pacing::Grouped => write!(f, "grouped"),
        }
    }
}

/// Socket-level options applied to every channel at creation.
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    /// Local port to bind; 0 requests an ephemeral port.
    pub port: u16,
    /// Receive buffer size in bytes.
    pub recv_buffer: usize,
    /// Send buffer size in bytes.
    pub send_buffer: usize,
    /// Outgoing TTL/Hop-Limit.
    pub ttl: u8,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            port: 0,
            recv_buffer: DEFAULT_BUFFER_SIZE,
            send_buffer: DEFAULT_BUFFER_SIZE,
            ttl: DEFAULT_TTL,
        }
    }
}

/// Requester role configuration.
#[derive(Debug, Clone)]
pub struct RequesterConfig {
    /// Target specifications: numeric addresses or host names.
    pub targets: Vec<String>,
    /// Destination UDP port on the responders.
    pub target_port: u16,
    /// Address families to probe.
    pub family: FamilySelection,
    /// Local socket options.
    pub socket: SocketOptions,
    /// Pacing policy.
    pub pacing: Pacing,
    /// Number of probe rounds.
    pub rounds: u64,
    /// Per-round interval.
    pub interval: Duration,
    /// Final wait window for straggler responses.
    pub wait: Duration,
    /// Requester key; 0 picks a random one at startup.
    pub key: u64,
    /// Abort the run on the first send failure.
    pub exit_on_error: bool,
    /// Report output format.
    pub report: ReportFormat,
}

impl RequesterConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.targets.is_empty() {
            return Err(ConfigurationError::NoTargets);
        }
        if self.rounds == 0 {
            return Err(ConfigurationError::ZeroRounds);
        }
        if self.interval.is_zero() {
            return Err(ConfigurationError::ZeroInterval);
        }
        Ok(())
    }
}

/// Responder role configuration.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Address family to listen on (exactly one).
    pub family: FamilySelection,
    /// Local socket options.
    pub socket: SocketOptions,
    /// Key written into every response.
    pub responder_key: u64,
    /// Accept only requests carrying this requester key; 0 accepts all.
    pub requester_key_filter: u64,
    /// Receive and report requests without answering them.
    pub monologue: bool,
    /// Abort on the first response send failure.
    pub exit_on_error: bool,
    /// Idle shutdown after this much inactivity; None runs forever.
    pub inactivity_timeout: Option<Duration>,
    /// Plugin shared objects to load at startup.
    pub plugins: Vec<PathBuf>,
    /// Report output format.
    pub report: ReportFormat,
}

impl ResponderConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.family == FamilySelection::Both {
            return Err(ConfigurationError::ResponderBothFamilies);
        }
        Ok(())
    }
}

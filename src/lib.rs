//! Unicast UDP latency and reachability measurement.
//!
//! Two roles share one fixed 96-byte payload: the requester sends
//! probe rounds to a set of targets and measures the round trips, the
//! responder answers each probe after stamping its own observations
//! into it. Both roles report every completed observation and run a
//! signal-aware event loop.

pub mod channel;
pub mod configuration;
pub mod events;
pub mod payload;
pub mod plugin;
pub mod report;
pub mod requester;
pub mod responder;
pub mod scheduler;
pub mod target;
pub mod time;

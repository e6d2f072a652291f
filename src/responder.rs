//! The responder role: answer probes, report them, notify plugins.
//!
//! A responder owns one channel on one address family and runs a
//! single event loop until terminated or idle past the configured
//! inactivity window. Every accepted request is reported and forwarded
//! to the plugin sandbox before the response goes out; in monologue
//! mode the response is suppressed and the responder acts as a pure
//! observer.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::channel::{Channel, ChannelError, ChannelFamily};
use crate::configuration::{FamilySelection, ResponderConfig};
use crate::events::{Event, EventMux};
use crate::payload::MessageType;
use crate::plugin::{PluginError, PluginSandbox};
use crate::report::{ReportError, Reporter};
use crate::time;

#[derive(Error, Debug)]
pub enum ResponderError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error("signal handling setup failed: {0}")]
    Events(std::io::Error),

    #[error("responder listens on a single address family")]
    BothFamilies,

    #[error("terminated by signal")]
    Terminated,

    #[error("response send aborted the run: {0}")]
    SendAborted(#[source] ChannelError),
}

/// Runs the responder to completion. Shutdown is always orderly:
/// plugins are drained and reaped, counters logged, the report
/// flushed, whatever ended the loop.
pub async fn run_responder(config: ResponderConfig) -> Result<(), ResponderError> {
    let family = match config.family {
        FamilySelection::V4 => ChannelFamily::Ipv4,
        FamilySelection::V6 => ChannelFamily::Ipv6,
        FamilySelection::Both => return Err(ResponderError::BothFamilies),
    };

    let mut sandbox = PluginSandbox::load(&config.plugins)?;
    let mut channel = Channel::open(family, &config.socket)?;
    let mut events = EventMux::new().map_err(ResponderError::Events)?;
    let mut reporter = Reporter::stdout(config.report);
    reporter.write_header()?;
    sandbox.spawn_all()?;

    log::info!(
        "{} listening on port {}, key {:#018x}{}",
        channel.name(),
        channel.assigned_port()?,
        config.responder_key,
        if config.monologue { ", monologue" } else { "" }
    );

    let result = serve(
        &config,
        &mut channel,
        &mut events,
        &mut reporter,
        &mut sandbox,
    )
    .await;

    sandbox.shutdown().await;
    channel.log_counters();
    if let Err(e) = reporter.flush() {
        log::error!("report flush failed: {}", e);
    }
    result
}

/// No inactivity timeout means the loop re-arms itself with a long
/// deadline that never matters.
const FOREVER: Duration = Duration::from_secs(365 * 24 * 3600);

async fn serve(
    config: &ResponderConfig,
    channel: &mut Channel,
    events: &mut EventMux,
    reporter: &mut Reporter,
    sandbox: &mut PluginSandbox,
) -> Result<(), ResponderError> {
    let window = config.inactivity_timeout.unwrap_or(FOREVER);
    let mut deadline = Instant::now() + window;

    loop {
        let handled = match events.wait(channel.readable(), deadline).await {
            Event::Ready => answer_pending(config, channel, reporter, sandbox).await?,
            Event::Timeout => {
                if config.inactivity_timeout.is_some() {
                    log::info!("inactivity timeout reached, shutting down");
                    return Ok(());
                }
                false
            }
            Event::Terminate => {
                log::info!("termination requested");
                return Err(ResponderError::Terminated);
            }
            Event::Reload => {
                // The responder holds no externally sourced state.
                log::debug!("reload requested, nothing to refresh");
                true
            }
            Event::DumpState => {
                channel.log_counters();
                for (name, state) in sandbox.states() {
                    log::info!("plugin '{}': {:?}", name, state);
                }
                true
            }
            Event::ChildState => {
                sandbox.reap();
                true
            }
        };
        // Only handled traffic or a handled signal slides the
        // inactivity window; a wake that produced no datagram leaves
        // the deadline in place.
        if handled {
            deadline = Instant::now() + window;
        }
    }
}

/// Drains and answers every pending request. Returns whether at least
/// one datagram arrived, valid or not.
async fn answer_pending(
    config: &ResponderConfig,
    channel: &mut Channel,
    reporter: &mut Reporter,
    sandbox: &mut PluginSandbox,
) -> Result<bool, ResponderError> {
    let mut activity = false;

    loop {
        let (mut payload, peer, ttl) = match channel.receive(MessageType::Request) {
            Ok(received) => received,
            Err(ChannelError::WouldBlock) => return Ok(activity),
            Err(e) => {
                activity = true;
                log::debug!("discarded datagram: {}", e);
                continue;
            }
        };
        activity = true;

        if config.requester_key_filter != 0 && payload.requester_key != config.requester_key_filter
        {
            log::debug!("request from {} filtered by requester key", peer);
            continue;
        }

        payload.message_type = MessageType::Response.wire();
        payload.ttl_seen_by_responder = ttl;
        payload.ttl_sent_by_responder = config.socket.ttl;
        payload.responder_key = config.responder_key;
        payload.monotonic_time_received = time::monotonic_ns();
        payload.real_time_received = time::wall_clock_ns();

        if let Err(e) = reporter.write_event(&payload, peer, None, None) {
            log::error!("report write failed: {}", e);
        }
        sandbox.notify_all(&payload.to_bytes());

        if config.monologue {
            continue;
        }
        match channel.send(&payload, peer).await {
            Ok(()) => {}
            Err(e) if config.exit_on_error => return Err(ResponderError::SendAborted(e)),
            Err(e) => log::warn!("response to {} failed: {}", peer, e),
        }
    }
}

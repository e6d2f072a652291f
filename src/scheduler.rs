//! Round scheduling for the requester.
//!
//! A round sends one probe to every target and lasts one interval.
//! Dispersed pacing splits the interval evenly across targets, pausing
//! after each send so responses interleave with sends; grouped pacing
//! sends the whole burst back to back and then waits out the interval.
//! Either way the loop stays responsive: responses are drained and
//! signals handled while waiting.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::channel::{Channel, ChannelError};
use crate::configuration::Pacing;
use crate::events::{Event, EventMux};
use crate::payload::{MessageType, ProbePayload, FORMAT_VERSION, MAGIC, PAYLOAD_SIZE};
use crate::target::TargetSet;
use crate::time;

#[derive(Error, Debug)]
pub enum SchedulerError {
    /// A send failed while exit-on-error was requested.
    #[error("probe send aborted the run: {0}")]
    SendAborted(#[source] ChannelError),
}

/// Everything one round needs, borrowed from the requester loop.
pub struct RoundContext<'a> {
    pub channel: &'a mut Channel,
    pub events: &'a mut EventMux,
    pub targets: &'a TargetSet,
    /// Zero-based round number, carried as the sequence number.
    pub round: u64,
    pub rounds_total: u64,
    pub interval: Duration,
    pub exit_on_error: bool,
    /// Local port the channel is bound to, carried in the payload.
    pub local_port: u16,
    pub target_port: u16,
    /// Outgoing TTL/Hop-Limit configured on the channel.
    pub ttl: u8,
    pub requester_key: u64,
}

/// How a round ended.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundOutcome {
    /// A termination signal arrived; the caller stops probing.
    pub terminated: bool,
    /// A reload signal arrived; the caller re-resolves targets before
    /// the next round.
    pub refresh_requested: bool,
}

/// Pause after each dispersed send. The extra nanosecond keeps the
/// round from finishing marginally early on exact divisions.
pub(crate) fn per_target_pause(interval: Duration, targets: usize) -> Duration {
    interval / targets.max(1) as u32 + Duration::from_nanos(1)
}

/// Runs one probe round and drains responses into `on_response`,
/// which receives each validated payload with its peer address and
/// the observed TTL/Hop-Limit.
pub async fn run_round(
    pacing: Pacing,
    ctx: &mut RoundContext<'_>,
    on_response: &mut impl FnMut(ProbePayload, SocketAddr, u8),
) -> Result<RoundOutcome, SchedulerError> {
    let started = Instant::now();
    let mut outcome = RoundOutcome::default();

    match pacing {
        Pacing::Dispersed => {
            // An empty set still burns the full interval so round
            // timing stays uniform.
            if ctx.targets.is_empty() {
                wait_until(ctx, started + ctx.interval, &mut outcome, on_response).await;
                return Ok(outcome);
            }
            let pause = per_target_pause(ctx.interval, ctx.targets.len());
            for (i, target) in ctx.targets.iter().enumerate() {
                send_probe(ctx, target).await?;
                let deadline = started + pause * (i as u32 + 1);
                wait_until(ctx, deadline, &mut outcome, on_response).await;
                if outcome.terminated {
                    return Ok(outcome);
                }
            }
        }
        Pacing::Grouped => {
            for target in ctx.targets.iter() {
                send_probe(ctx, target).await?;
            }
            wait_until(ctx, started + ctx.interval, &mut outcome, on_response).await;
        }
    }

    Ok(outcome)
}

/// Waits out a final window for straggler responses after the last
/// round, still handling signals.
pub async fn drain_stragglers(
    ctx: &mut RoundContext<'_>,
    window: Duration,
    on_response: &mut impl FnMut(ProbePayload, SocketAddr, u8),
) -> RoundOutcome {
    let mut outcome = RoundOutcome::default();
    wait_until(ctx, Instant::now() + window, &mut outcome, on_response).await;
    outcome
}

async fn send_probe(
    ctx: &mut RoundContext<'_>,
    target: &crate::target::Target,
) -> Result<(), SchedulerError> {
    let payload = ProbePayload {
        magic: MAGIC,
        format_version: FORMAT_VERSION,
        message_type: MessageType::Request.wire(),
        port: ctx.local_port,
        ttl_sent_by_requester: ctx.ttl,
        ttl_seen_by_responder: 0,
        ttl_sent_by_responder: 0,
        ip_version: target.addr.version,
        extended_length: PAYLOAD_SIZE as u16,
        sequence_number: ctx.round,
        sequence_length: ctx.rounds_total,
        address_low: target.addr.low,
        address_high: target.addr.high,
        requester_key: ctx.requester_key,
        responder_key: 0,
        monotonic_time_sent: time::monotonic_ns(),
        real_time_sent: time::wall_clock_ns(),
        monotonic_time_received: 0,
        real_time_received: 0,
    };

    let destination = target.socket_addr(ctx.target_port);
    match ctx.channel.send(&payload, destination).await {
        Ok(()) => Ok(()),
        Err(e) if ctx.exit_on_error => Err(SchedulerError::SendAborted(e)),
        Err(e) => {
            log::warn!("probe to {} failed: {}", destination, e);
            Ok(())
        }
    }
}

/// Blocks until the deadline, draining responses and handling signals.
async fn wait_until(
    ctx: &mut RoundContext<'_>,
    deadline: Instant,
    outcome: &mut RoundOutcome,
    on_response: &mut impl FnMut(ProbePayload, SocketAddr, u8),
) {
    loop {
        let event = ctx.events.wait(ctx.channel.readable(), deadline).await;
        match event {
            Event::Timeout => return,
            Event::Terminate => {
                outcome.terminated = true;
                return;
            }
            Event::Reload => {
                log::info!("reload requested, targets will be re-resolved");
                outcome.refresh_requested = true;
            }
            Event::DumpState => {
                log::info!(
                    "round {}/{}: {} targets",
                    ctx.round + 1,
                    ctx.rounds_total,
                    ctx.targets.len()
                );
                ctx.channel.log_counters();
            }
            // The requester has no children to reap.
            Event::ChildState => {}
            Event::Ready => drain_responses(ctx, on_response),
        }
    }
}

/// Receives until the socket runs dry, forwarding valid responses.
fn drain_responses(
    ctx: &mut RoundContext<'_>,
    on_response: &mut impl FnMut(ProbePayload, SocketAddr, u8),
) {
    loop {
        match ctx.channel.receive(MessageType::Response) {
            Ok((payload, peer, ttl)) => on_response(payload, peer, ttl),
            Err(ChannelError::WouldBlock) => return,
            Err(e) => {
                // Already counted by the channel; foreign or damaged
                // traffic must not stall the round.
                log::debug!("discarded datagram: {}", e);
            }
        }
    }
}

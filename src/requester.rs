//! The requester role: send probe rounds, collect responses, report.
//!
//! One independent event loop runs per address family, each owning its
//! channel and signal streams; the report sink is the only shared
//! state. A run is a fixed number of rounds followed by a final wait
//! window for straggler responses.

use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use thiserror::Error;

use crate::channel::{Channel, ChannelError, ChannelFamily};
use crate::configuration::RequesterConfig;
use crate::events::EventMux;
use crate::report::{ReportError, Reporter};
use crate::scheduler::{self, RoundContext, SchedulerError};
use crate::target::{ProbeAddress, TargetSet};
use crate::time;

#[derive(Error, Debug)]
pub enum RequesterError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error("signal handling setup failed: {0}")]
    Events(std::io::Error),

    #[error("no target specification resolved to a usable address")]
    NoTargets,

    #[error("terminated by signal")]
    Terminated,

    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Runs the requester to completion: all rounds on every configured
/// family, the final wait window, then counters and a report flush.
pub async fn run_requester(config: RequesterConfig) -> Result<(), RequesterError> {
    let key = effective_key(config.key);
    log::info!("requester key {:#018x}", key);

    let targets = TargetSet::resolve(&config.targets, config.family).await;
    if targets.is_empty() {
        return Err(RequesterError::NoTargets);
    }
    log::info!("{} targets resolved", targets.len());

    let reporter = Arc::new(Mutex::new(Reporter::stdout(config.report)));
    lock_reporter(&reporter).write_header()?;

    let mut workers = Vec::new();
    for family in [ChannelFamily::Ipv4, ChannelFamily::Ipv6] {
        if !config.family.covers(family.ip_version()) {
            continue;
        }
        let subset = targets.family_subset(family.ip_version());
        if subset.is_empty() {
            log::debug!("no {} targets, channel not opened", family);
            continue;
        }
        let config = config.clone();
        let reporter = Arc::clone(&reporter);
        workers.push(tokio::spawn(run_family(
            family, config, key, subset, reporter,
        )));
    }

    let mut result = Ok(());
    for worker in workers {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if result.is_ok() {
                    result = Err(e);
                }
            }
            Err(e) => {
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
    }

    lock_reporter(&reporter).flush()?;
    result
}

/// A worker that panicked while holding the report lock must not cost
/// the run its header or final flush; a poisoned lock still yields the
/// reporter.
fn lock_reporter(reporter: &Mutex<Reporter>) -> MutexGuard<'_, Reporter> {
    reporter.lock().unwrap_or_else(|e| e.into_inner())
}

/// The key written into every probe; 0 in the configuration selects a
/// random non-zero key for the run.
fn effective_key(configured: u64) -> u64 {
    if configured != 0 {
        return configured;
    }
    rand::thread_rng().gen_range(1..=u64::MAX)
}

/// The per-family event loop: one channel, its own signal streams, all
/// rounds, the straggler window.
async fn run_family(
    family: ChannelFamily,
    config: RequesterConfig,
    key: u64,
    mut targets: TargetSet,
    reporter: Arc<Mutex<Reporter>>,
) -> Result<(), RequesterError> {
    let mut channel = Channel::open(family, &config.socket)?;
    let local_port = channel.assigned_port()?;
    let mut events = EventMux::new().map_err(RequesterError::Events)?;
    log::info!(
        "{}: probing {} targets from port {}",
        channel.name(),
        targets.len(),
        local_port
    );

    let mut terminated = false;
    let mut round = 0;
    while round < config.rounds && !terminated {
        let outcome = {
            let mut on_response = response_handler(key, &targets, &reporter);
            let mut ctx = RoundContext {
                channel: &mut channel,
                events: &mut events,
                targets: &targets,
                round,
                rounds_total: config.rounds,
                interval: config.interval,
                exit_on_error: config.exit_on_error,
                local_port,
                target_port: config.target_port,
                ttl: config.socket.ttl,
                requester_key: key,
            };
            scheduler::run_round(config.pacing, &mut ctx, &mut on_response).await?
        };

        terminated = outcome.terminated;
        if outcome.refresh_requested && !terminated {
            let refreshed = TargetSet::resolve(&config.targets, config.family)
                .await
                .family_subset(family.ip_version());
            if refreshed.is_empty() {
                log::warn!("refresh produced no {} targets, keeping previous set", family);
            } else {
                log::info!("{} targets after refresh: {}", family, refreshed.len());
                targets = refreshed;
            }
        }
        round += 1;
    }

    if !terminated && !config.wait.is_zero() {
        let mut on_response = response_handler(key, &targets, &reporter);
        let mut ctx = RoundContext {
            channel: &mut channel,
            events: &mut events,
            targets: &targets,
            round: config.rounds,
            rounds_total: config.rounds,
            interval: config.interval,
            exit_on_error: config.exit_on_error,
            local_port,
            target_port: config.target_port,
            ttl: config.socket.ttl,
            requester_key: key,
        };
        scheduler::drain_stragglers(&mut ctx, config.wait, &mut on_response).await;
    }

    channel.log_counters();
    if terminated {
        return Err(RequesterError::Terminated);
    }
    Ok(())
}

/// Builds the per-round response callback: match the run key, compute
/// the round trip time, annotate with the target's host name, report.
fn response_handler<'a>(
    key: u64,
    targets: &'a TargetSet,
    reporter: &'a Arc<Mutex<Reporter>>,
) -> impl FnMut(crate::payload::ProbePayload, std::net::SocketAddr, u8) + 'a {
    move |payload, peer, _ttl| {
        if payload.requester_key != key {
            log::debug!("response from {} carries foreign key, ignored", peer);
            return;
        }
        let rtt = time::monotonic_ns().saturating_sub(payload.monotonic_time_sent);
        let probe_addr: ProbeAddress = peer.ip().into();
        let hostname = targets.name_of(&probe_addr);
        if let Err(e) = lock_reporter(reporter).write_event(&payload, peer, hostname, Some(rtt)) {
            log::error!("report write failed: {}", e);
        }
    }
}

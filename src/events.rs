//! Signal-aware event multiplexing.
//!
//! Both roles block in a single place: waiting for the socket to
//! become readable, a deadline to pass, or a Unix signal to arrive.
//! `EventMux` folds all of those into one future so signal handling
//! can never starve and the caller sees a plain event value.
//!
//! Deadlines are absolute instants rather than countdowns, so handling
//! an informational signal (such as a state dump) does not consume any
//! of the timeout budget.

use std::future::Future;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time::Instant;

/// What woke the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The socket has a datagram pending.
    Ready,
    /// The deadline passed.
    Timeout,
    /// SIGINT or SIGTERM: shut down in an orderly fashion.
    Terminate,
    /// SIGHUP: refresh externally sourced state (target resolution).
    Reload,
    /// SIGUSR1: log current statistics without disturbing the run.
    DumpState,
    /// SIGCHLD: a child process changed state.
    ChildState,
}

/// The set of signal streams one event loop listens on.
///
/// Each loop owns its own mux; tokio delivers process signals to every
/// registered stream, so independent loops all observe them.
pub struct EventMux {
    sigint: Signal,
    sigterm: Signal,
    sighup: Signal,
    sigusr1: Signal,
    sigchld: Signal,
}

impl EventMux {
    /// Registers the signal streams. Must run inside a tokio runtime.
    pub fn new() -> std::io::Result<Self> {
        Ok(EventMux {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sighup: signal(SignalKind::hangup())?,
            sigusr1: signal(SignalKind::user_defined1())?,
            sigchld: signal(SignalKind::child())?,
        })
    }

    /// Waits for the first of: socket readiness, the deadline, or a
    /// signal. A failed readiness future is treated as a timeout; the
    /// subsequent receive surfaces the real error.
    pub async fn wait(
        &mut self,
        readable: impl Future<Output = std::io::Result<()>>,
        deadline: Instant,
    ) -> Event {
        tokio::select! {
            _ = self.sigint.recv() => Event::Terminate,
            _ = self.sigterm.recv() => Event::Terminate,
            _ = self.sighup.recv() => Event::Reload,
            _ = self.sigusr1.recv() => Event::DumpState,
            _ = self.sigchld.recv() => Event::ChildState,
            result = readable => match result {
                Ok(()) => Event::Ready,
                Err(_) => Event::Timeout,
            },
            _ = tokio::time::sleep_until(deadline) => Event::Timeout,
        }
    }

    /// Waits for the deadline or a signal, ignoring the socket.
    pub async fn idle(&mut self, deadline: Instant) -> Event {
        self.wait(std::future::pending(), deadline).await
    }
}

//! Process-isolated notification plugins.
//!
//! The responder can forward every observed request to external
//! plugins, shared objects exposing a tiny C ABI. A crashing or
//! blocking plugin must never take the responder down, so each plugin
//! runs in its own child process: the parent re-executes its own
//! binary in a worker mode that loads the shared object and feeds it
//! records read from standard input.
//!
//! The parent talks to each worker over a pipe whose write end is
//! non-blocking. Records are one payload wide, well below PIPE_BUF, so
//! writes are atomic: a full pipe drops the record for that plugin
//! only and the others still receive it.

use std::ffi::{c_char, c_int, CStr};
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use thiserror::Error;

/// Exported symbol returning the plugin's display name.
pub const SYMBOL_NAME: &[u8] = b"probe_plugin_name";
/// Exported symbol called once before any notification.
pub const SYMBOL_INIT: &[u8] = b"probe_plugin_init";
/// Exported symbol called once per observed request.
pub const SYMBOL_NOTIFY: &[u8] = b"probe_plugin_notify";
/// Exported symbol called once at orderly shutdown.
pub const SYMBOL_CLEANUP: &[u8] = b"probe_plugin_cleanup";

type NameFn = unsafe extern "C" fn() -> *const c_char;
type InitFn = unsafe extern "C" fn() -> c_int;
type NotifyFn = unsafe extern "C" fn(*const u8, usize) -> c_int;
type CleanupFn = unsafe extern "C" fn();

/// The command line flag selecting worker mode in the responder
/// binary.
pub const WORKER_FLAG: &str = "--plugin-worker";

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("could not load plugin {path}: {source}")]
    Load {
        path: PathBuf,
        source: libloading::Error,
    },

    #[error("plugin {path} lacks required symbol {symbol}")]
    MissingSymbol { path: PathBuf, symbol: String },

    #[error("plugin {path} returned an invalid name")]
    BadName { path: PathBuf },

    #[error("could not spawn worker for {path}: {source}")]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("pipe setup failed: {0}")]
    Pipe(Errno),
}

/// Lifecycle of one plugin worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// Validated, worker not yet spawned.
    Prepared,
    /// Worker running and receiving records.
    Running,
    /// Worker stopped by a job-control signal; deliveries resume when
    /// it continues.
    Paused,
    /// Worker exited or was killed; no further records are sent.
    Stopped,
}

struct Plugin {
    name: String,
    path: PathBuf,
    state: PluginState,
    child: Option<Child>,
    pipe: Option<OwnedFd>,
}

/// The set of plugin workers owned by the responder.
#[derive(Default)]
pub struct PluginSandbox {
    plugins: Vec<Plugin>,
}

impl PluginSandbox {
    /// Validates every shared object in the parent and prepares the
    /// plugin list. Fails on the first unusable plugin; a responder
    /// with a broken plugin configuration should not start.
    pub fn load(paths: &[PathBuf]) -> Result<Self, PluginError> {
        let mut plugins = Vec::with_capacity(paths.len());
        for path in paths {
            let name = validate_plugin(path)?;
            log::info!("plugin '{}' prepared from {}", name, path.display());
            plugins.push(Plugin {
                name,
                path: path.clone(),
                state: PluginState::Prepared,
                child: None,
                pipe: None,
            });
        }
        Ok(PluginSandbox { plugins })
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Spawns one worker per prepared plugin. The worker is this same
    /// binary re-executed in worker mode with the pipe read end as its
    /// standard input.
    pub fn spawn_all(&mut self) -> Result<(), PluginError> {
        // A worker closing its pipe must surface as EPIPE on write,
        // not kill the responder.
        ignore_sigpipe();

        let exe = std::env::current_exe().map_err(|e| PluginError::Spawn {
            path: PathBuf::from("<self>"),
            source: e,
        })?;

        for plugin in &mut self.plugins {
            if plugin.state != PluginState::Prepared {
                continue;
            }

            let (read_end, write_end) = nix::unistd::pipe().map_err(PluginError::Pipe)?;
            set_nonblocking(&write_end)?;

            let child = Command::new(&exe)
                .arg(WORKER_FLAG)
                .arg(&plugin.path)
                .stdin(Stdio::from(read_end))
                .spawn()
                .map_err(|e| PluginError::Spawn {
                    path: plugin.path.clone(),
                    source: e,
                })?;

            log::info!(
                "plugin '{}' worker started, pid {}",
                plugin.name,
                child.id()
            );
            plugin.child = Some(child);
            plugin.pipe = Some(write_end);
            plugin.state = PluginState::Running;
        }
        Ok(())
    }

    /// Delivers one record to every running worker. A full pipe drops
    /// the record for that worker only; a closed pipe stops the
    /// worker's deliveries. Never blocks and never fails the caller.
    pub fn notify_all(&mut self, record: &[u8]) {
        for plugin in &mut self.plugins {
            if plugin.state != PluginState::Running {
                continue;
            }
            let Some(pipe) = &plugin.pipe else { continue };

            match nix::unistd::write(pipe, record) {
                Ok(n) if n == record.len() => {}
                Ok(n) => {
                    // Atomicity below PIPE_BUF makes this unreachable
                    // for whole records; log it if it ever happens.
                    log::error!(
                        "partial record ({} of {} bytes) to plugin '{}'",
                        n,
                        record.len(),
                        plugin.name
                    );
                }
                Err(Errno::EAGAIN) => {
                    log::warn!("plugin '{}' pipe full, record dropped", plugin.name);
                }
                Err(Errno::EPIPE) => {
                    log::warn!("plugin '{}' closed its pipe", plugin.name);
                    plugin.pipe = None;
                    plugin.state = PluginState::Stopped;
                }
                Err(e) => {
                    log::warn!("write to plugin '{}' failed: {}", plugin.name, e);
                }
            }
        }
    }

    /// Collects pending child state changes without blocking. Called
    /// on every SIGCHLD notification.
    pub fn reap(&mut self) {
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        loop {
            match waitpid(None, Some(flags)) {
                Ok(WaitStatus::StillAlive) => return,
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.mark(pid, PluginState::Stopped, &format!("exited ({})", code));
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    self.mark(pid, PluginState::Stopped, &format!("killed by {}", sig));
                }
                Ok(WaitStatus::Stopped(pid, sig)) => {
                    self.mark(pid, PluginState::Paused, &format!("stopped by {}", sig));
                }
                Ok(WaitStatus::Continued(pid)) => {
                    self.mark(pid, PluginState::Running, "continued");
                }
                Ok(_) => {}
                Err(Errno::ECHILD) => return,
                Err(e) => {
                    log::warn!("wait for plugin workers failed: {}", e);
                    return;
                }
            }
        }
    }

    fn mark(&mut self, pid: Pid, state: PluginState, what: &str) {
        for plugin in &mut self.plugins {
            let matches_pid = plugin
                .child
                .as_ref()
                .map(|c| c.id() == pid.as_raw() as u32)
                .unwrap_or(false);
            if matches_pid {
                log::info!("plugin '{}' worker {}", plugin.name, what);
                plugin.state = state;
                if state == PluginState::Stopped {
                    plugin.pipe = None;
                    plugin.child = None;
                }
                return;
            }
        }
        log::debug!("state change for unknown child {}", pid);
    }

    /// Orderly shutdown: closing the pipes signals end of input, the
    /// workers run their cleanup hooks and exit. Workers that outstay
    /// a short grace period are killed. The grace polling yields to
    /// the runtime between reaps.
    pub async fn shutdown(&mut self) {
        for plugin in &mut self.plugins {
            plugin.pipe = None;
        }

        let grace = Duration::from_secs(2);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            self.reap();
            if self.plugins.iter().all(|p| p.child.is_none()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for plugin in &mut self.plugins {
            if let Some(child) = plugin.child.take() {
                let pid = Pid::from_raw(child.id() as i32);
                log::warn!("plugin '{}' did not exit, killing", plugin.name);
                if let Err(e) = kill(pid, Signal::SIGKILL) {
                    log::warn!("kill of plugin '{}' failed: {}", plugin.name, e);
                }
                let _ = waitpid(pid, None);
                plugin.state = PluginState::Stopped;
            }
        }
    }

    /// Current worker states, for state dumps.
    pub fn states(&self) -> Vec<(String, PluginState)> {
        self.plugins
            .iter()
            .map(|p| (p.name.clone(), p.state))
            .collect()
    }
}

/// Loads the shared object just long enough to check its ABI and read
/// its name. The worker performs the real load in its own process.
fn validate_plugin(path: &Path) -> Result<String, PluginError> {
    let library = unsafe { libloading::Library::new(path) }.map_err(|e| PluginError::Load {
        path: path.to_path_buf(),
        source: e,
    })?;

    let missing = |symbol: &[u8]| PluginError::MissingSymbol {
        path: path.to_path_buf(),
        symbol: String::from_utf8_lossy(symbol).into_owned(),
    };

    let name_fn = unsafe { library.get::<NameFn>(SYMBOL_NAME) }.map_err(|_| missing(SYMBOL_NAME))?;
    unsafe { library.get::<InitFn>(SYMBOL_INIT) }.map_err(|_| missing(SYMBOL_INIT))?;
    unsafe { library.get::<NotifyFn>(SYMBOL_NOTIFY) }.map_err(|_| missing(SYMBOL_NOTIFY))?;
    unsafe { library.get::<CleanupFn>(SYMBOL_CLEANUP) }.map_err(|_| missing(SYMBOL_CLEANUP))?;

    let raw_name = unsafe { name_fn() };
    if raw_name.is_null() {
        return Err(PluginError::BadName {
            path: path.to_path_buf(),
        });
    }
    let name = unsafe { CStr::from_ptr(raw_name) }
        .to_str()
        .map_err(|_| PluginError::BadName {
            path: path.to_path_buf(),
        })?
        .to_string();
    if name.is_empty() {
        return Err(PluginError::BadName {
            path: path.to_path_buf(),
        });
    }
    Ok(name)
}

/// Worker-mode entry point: loads the plugin, feeds it records from
/// standard input until end of file, then runs its cleanup. The return
/// value becomes the process exit code.
pub fn run_worker(path: &Path, record_size: usize) -> i32 {
    let library = match unsafe { libloading::Library::new(path) } {
        Ok(lib) => lib,
        Err(e) => {
            log::error!("worker could not load {}: {}", path.display(), e);
            return 1;
        }
    };

    let (init, notify, cleanup) = unsafe {
        let init = match library.get::<InitFn>(SYMBOL_INIT) {
            Ok(f) => f,
            Err(e) => {
                log::error!("worker symbol lookup failed: {}", e);
                return 1;
            }
        };
        let notify = match library.get::<NotifyFn>(SYMBOL_NOTIFY) {
            Ok(f) => f,
            Err(e) => {
                log::error!("worker symbol lookup failed: {}", e);
                return 1;
            }
        };
        let cleanup = match library.get::<CleanupFn>(SYMBOL_CLEANUP) {
            Ok(f) => f,
            Err(e) => {
                log::error!("worker symbol lookup failed: {}", e);
                return 1;
            }
        };
        (init, notify, cleanup)
    };

    let rc = unsafe { init() };
    if rc != 0 {
        log::error!("plugin init failed with {}", rc);
        return 1;
    }

    let mut stdin = std::io::stdin().lock();
    let mut record = vec![0u8; record_size];
    loop {
        match stdin.read_exact(&mut record) {
            Ok(()) => {
                let rc = unsafe { notify(record.as_ptr(), record.len()) };
                if rc != 0 {
                    log::warn!("plugin notify returned {}", rc);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                log::error!("worker read failed: {}", e);
                unsafe { cleanup() };
                return 1;
            }
        }
    }

    unsafe { cleanup() };
    0
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), PluginError> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(PluginError::Pipe(Errno::last()));
    }
    let rc = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(PluginError::Pipe(Errno::last()));
    }
    Ok(())
}

fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

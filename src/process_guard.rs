//! Lifecycle management for local ssh/scp child processes
//!
//! Every ssh and scp invocation is spawned in its own process group and
//! registered here while it runs. If hostseed receives SIGINT, SIGTERM or
//! SIGHUP, or the `ProcessGuard` held by `main` is dropped, every registered
//! group gets SIGTERM, then SIGKILL after a grace period. Children also get
//! `PR_SET_PDEATHSIG`, so a crash of hostseed takes its ssh master with it.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::io;
use std::process::{Command, Output};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Process-wide registry; signal handlers have no other way to reach it
static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Registry of running child process groups
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// Get or create the global child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    /// Register `pid` in the global registry
    pub fn register_global(pid: u32) {
        if let Ok(mut registry) = Self::global().lock() {
            registry.register(pid);
        }
    }

    /// Remove `pid` from the global registry
    pub fn unregister_global(pid: u32) {
        if let Ok(mut registry) = Self::global().lock() {
            registry.unregister(pid);
        }
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        tracing::trace!("Registered child process {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        tracing::trace!("Unregistered child process {}", pid);
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// SIGTERM every registered group, wait up to `grace_period`, then SIGKILL
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            return;
        }

        tracing::info!("Terminating {} ssh/scp process(es)", self.pids.len());
        let pids: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids {
            signal_group_or_process(pid, Signal::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids.iter().all(|&pid| !is_process_alive(pid)) {
                self.pids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in &pids {
            if is_process_alive(pid) {
                tracing::warn!("Process group {} ignored SIGTERM, sending SIGKILL", pid);
                signal_group_or_process(pid, Signal::SIGKILL);
            }
        }
        self.pids.clear();
    }
}

/// Signal the whole group (negative pid), falling back to the process itself
fn signal_group_or_process(pid: u32, sig: Signal) {
    if let Err(e) = signal::kill(Pid::from_raw(-(pid as i32)), sig) {
        tracing::debug!("Group signal {} to {} failed: {}", sig, pid, e);
        if let Err(e) = send_signal(pid, sig) {
            tracing::debug!("Signal {} to {} failed: {}", sig, pid, e);
        }
    }
}

fn send_signal(pid: u32, sig: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), sig)
}

/// True unless the process is gone or a zombie
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => {
            // The state field follows the parenthesised command name
            let state = stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next());
            !matches!(state, Some("Z") | Some("X"))
        }
        Err(_) => true,
    }
}

/// Terminates registered children when dropped
#[derive(Debug)]
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }

    pub fn child_count(&self) -> usize {
        self.registry.lock().map(|r| r.count()).unwrap_or(0)
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(Duration::from_secs(3));
        }
    }
}

/// Install handlers for SIGINT, SIGTERM and SIGHUP.
///
/// The handler thread tears down registered children and exits with
/// `128 + signal`. Cancellation is coarse: a step in flight is abandoned, and
/// the guarded-file protocol recovers it on the next run.
pub fn init_signal_handlers() -> io::Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            tracing::warn!(
                "Received {}, stopping",
                crate::session::signal_name(sig)
            );
            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.terminate_all(Duration::from_secs(3));
            }
            std::process::exit(128 + sig);
        }
    });
    Ok(())
}

/// Extension trait for `Command` to run the child in its own process group
pub trait CommandProcessGroup {
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe functions (setpgid, prctl)
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(io::Error::other)?;
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}

/// Run `cmd` to completion in its own registered process group, capturing
/// stdout and stderr.
pub fn output_guarded(cmd: &mut Command) -> io::Result<Output> {
    use std::process::Stdio;

    let child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group()
        .spawn()?;
    let pid = child.id();
    ChildRegistry::register_global(pid);
    let output = child.wait_with_output();
    ChildRegistry::unregister_global(pid);
    output
}

//! Remote sessions.
//!
//! `Session` is the seam between the provisioning engine and the channel that
//! reaches the remote machine. The production implementation, `SshSession`,
//! drives the OpenSSH client: one master connection per run (opened with a
//! bounded `ConnectTimeout`) and one multiplexed `ssh -S` invocation per
//! command.
//!
//! # Exit status
//!
//! A command either reports a Unix exit code or the name of the signal that
//! terminated the channel, never both. See [`ExitStatus`].
//!
//! OpenSSH turns a remote death by signal N into a plain exit code 128+N. To
//! keep the two apart, every command runs inside [`with_signal_report`],
//! which writes a marker line to stderr when its child was killed. Marker and
//! code are folded back into [`ExitStatus::Signal`] by
//! [`resolve_signal_report`]. A command that really exits with 129-192 is
//! therefore read as interrupted.

use crate::command::{RemoteCommand, sh_quote};
use crate::error::{ProvisionError, Result};
use crate::process_guard::{self, ChildRegistry, CommandProcessGroup};
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// How a remote command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// The command returned this exit code (0-255, high codes are real codes)
    Code(i32),
    /// The channel was terminated by this signal (e.g. `SIGKILL`)
    Signal(String),
}

impl ExitStatus {
    /// Convert a local process status into an exit status.
    pub fn from_process(status: std::process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Code(code),
            (None, Some(signal)) => Self::Signal(signal_name(signal)),
            // Neither is reported only for stopped/continued children
            (None, None) => Self::Signal("UNKNOWN".to_string()),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {}", code),
            Self::Signal(signal) => write!(f, "signal {}", signal),
        }
    }
}

/// Stderr prefix written by [`with_signal_report`]
const SIGNAL_MARKER: &str = "hostseed-exit-signal:";

/// Wrap `command_line` so the remote shell reports the signal that killed it.
pub fn with_signal_report(command_line: &str) -> String {
    format!(
        "sh -c {}; s=$?; \
         if [ \"$s\" -gt 128 ] && [ \"$s\" -le 192 ]; then \
         printf '{}%d\\n' \"$((s - 128))\" >&2; fi; exit \"$s\"",
        sh_quote(command_line),
        SIGNAL_MARKER
    )
}

/// Strip the marker left by [`with_signal_report`] from `stderr` and turn a
/// matching 128+N code into `Signal`. Anything else passes through unchanged.
pub fn resolve_signal_report(status: ExitStatus, stderr: &str) -> (ExitStatus, String) {
    let code = match status {
        ExitStatus::Code(code) => code,
        other => return (other, stderr.to_string()),
    };
    let Some(at) = stderr.rfind(SIGNAL_MARKER) else {
        return (status, stderr.to_string());
    };
    let rest = &stderr[at + SIGNAL_MARKER.len()..];
    let (number, after) = rest.split_once('\n').unwrap_or((rest, ""));
    match number.trim().parse::<i32>() {
        Ok(signal) if code == 128 + signal => (
            ExitStatus::Signal(signal_name(signal)),
            format!("{}{}", &stderr[..at], after),
        ),
        _ => (status, stderr.to_string()),
    }
}

/// Raw output of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

/// An open, authenticated channel to one remote machine.
pub trait Session {
    /// Run a shell command line on the remote machine.
    ///
    /// `Err` means the channel itself failed; a command that ran and failed is
    /// an `Ok` with a nonzero [`ExitStatus`].
    fn exec(&mut self, command_line: &str) -> Result<RawOutput>;

    /// Run a typed request. The default renders it and calls `exec`.
    fn run(&mut self, command: &RemoteCommand) -> Result<RawOutput> {
        self.exec(&command.render())
    }

    /// Close the channel. Closing twice is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
    /// Private key; `None` leaves key selection to ssh
    pub identity_file: Option<PathBuf>,
}

impl SshTarget {
    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options shared by ssh and scp. `port_flag` is `-p` for ssh, `-P` for scp.
    pub(crate) fn configure(&self, cmd: &mut Command, port_flag: &str) {
        cmd.arg(port_flag).arg(self.port.to_string());
        if let Some(identity) = &self.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg("-o").arg("BatchMode=yes");
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Parameters for opening a session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub target: SshTarget,
    pub connect_timeout: Duration,
}

/// OpenSSH client session multiplexed over a control socket.
#[derive(Debug)]
pub struct SshSession {
    target: SshTarget,
    socket: PathBuf,
    master: Option<Child>,
    // Keeps the socket directory alive; removed on drop
    _socket_dir: TempDir,
}

impl SshSession {
    /// Open the master connection, waiting at most `connect_timeout`.
    pub fn connect(options: &ConnectOptions) -> Result<Self> {
        let socket_dir = tempfile::Builder::new()
            .prefix("hostseed-ssh-")
            .tempdir()
            .map_err(|e| ProvisionError::connection(format!("cannot create socket dir: {}", e)))?;
        let socket = socket_dir.path().join("control");
        let timeout_secs = options.connect_timeout.as_secs().max(1);

        let mut cmd = Command::new("ssh");
        options.target.configure(&mut cmd, "-p");
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", timeout_secs))
            .arg("-M")
            .arg("-N")
            .arg("-S")
            .arg(&socket)
            .arg(options.target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .in_new_process_group();

        tracing::info!("Opening ssh master connection to {}", options.target);
        let mut master = cmd
            .spawn()
            .map_err(|e| ProvisionError::connection(format!("failed to spawn ssh: {}", e)))?;
        ChildRegistry::register_global(master.id());

        let deadline = Instant::now() + options.connect_timeout + Duration::from_secs(1);
        loop {
            if let Some(status) = master.try_wait()? {
                ChildRegistry::unregister_global(master.id());
                let stderr = read_stderr(&mut master);
                return Err(ProvisionError::connection(format!(
                    "ssh to {} exited with {}: {}",
                    options.target,
                    ExitStatus::from_process(status),
                    stderr.trim()
                )));
            }
            if control_check(&options.target, &socket) {
                break;
            }
            if Instant::now() >= deadline {
                let _ = master.kill();
                let _ = master.wait();
                ChildRegistry::unregister_global(master.id());
                return Err(ProvisionError::connection(format!(
                    "timed out after {}s connecting to {}",
                    timeout_secs, options.target
                )));
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        tracing::info!("Connected to {}", options.target);
        Ok(Self {
            target: options.target.clone(),
            socket,
            master: Some(master),
            _socket_dir: socket_dir,
        })
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    fn master_alive(&self) -> bool {
        self.master.is_some() && control_check(&self.target, &self.socket)
    }
}

impl Session for SshSession {
    fn exec(&mut self, command_line: &str) -> Result<RawOutput> {
        if self.master.is_none() {
            return Err(ProvisionError::channel("session is closed"));
        }

        let mut cmd = Command::new("ssh");
        self.target.configure(&mut cmd, "-p");
        cmd.arg("-S")
            .arg(&self.socket)
            .arg(self.target.destination())
            .arg("--")
            .arg(with_signal_report(command_line))
            .stdin(Stdio::null());

        let output = process_guard::output_guarded(&mut cmd)
            .map_err(|e| ProvisionError::channel(format!("failed to run ssh: {}", e)))?;
        let status = ExitStatus::from_process(output.status);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // OpenSSH reports its own failures as 255; only a dead master makes that a channel error
        if status == ExitStatus::Code(255) && !self.master_alive() {
            return Err(ProvisionError::channel(format!(
                "lost connection to {}: {}",
                self.target,
                stderr.trim()
            )));
        }

        let (status, stderr) = resolve_signal_report(status, &stderr);
        Ok(RawOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            status,
        })
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut master) = self.master.take() else {
            return Ok(());
        };

        let mut cmd = Command::new("ssh");
        cmd.arg("-S")
            .arg(&self.socket)
            .arg("-O")
            .arg("exit")
            .arg(self.target.destination())
            .stdin(Stdio::null());
        if let Err(e) = process_guard::output_guarded(&mut cmd) {
            tracing::warn!("ssh -O exit failed: {}", e);
        }

        // The master normally exits on its own after -O exit
        let deadline = Instant::now() + Duration::from_secs(2);
        while master.try_wait()?.is_none() {
            if Instant::now() >= deadline {
                let _ = master.kill();
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        let _ = master.wait();
        ChildRegistry::unregister_global(master.id());
        tracing::info!("Closed connection to {}", self.target);
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close ssh session: {}", e);
        }
    }
}

/// `ssh -O check`: true while the master connection is up.
fn control_check(target: &SshTarget, socket: &Path) -> bool {
    if !socket.exists() {
        return false;
    }
    let mut cmd = Command::new("ssh");
    cmd.arg("-S")
        .arg(socket)
        .arg("-O")
        .arg("check")
        .arg(target.destination())
        .stdin(Stdio::null());
    process_guard::output_guarded(&mut cmd)
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn read_stderr(child: &mut Child) -> String {
    use std::io::Read;
    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        let _ = pipe.read_to_string(&mut stderr);
    }
    stderr
}

/// `SIGKILL`-style name for a raw signal number.
pub fn signal_name(signal: i32) -> String {
    nix::sys::signal::Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{}", signal))
}

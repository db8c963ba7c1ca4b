//! Command execution and result classification.
//!
//! `CommandRunner` is the only way the engine talks to the remote machine.
//! It owns the session for the lifetime of a run, sends typed requests,
//! and classifies each result into an explicit [`Outcome`]:
//!
//! - exit code 0 is `Success`
//! - any other exit code is `CommandFailure`, including codes of 128 and
//!   above, which are real codes unless a signal name is attached
//! - a signal name is `ChannelInterrupted`, whatever the code would have been
//!
//! Callers that use a command as a yes/no question go through [`probe`],
//! which turns an interruption into [`Probe::Inconclusive`] rather than "no".
//!
//! [`probe`]: CommandRunner::probe

use crate::command::RemoteCommand;
use crate::error::{ProvisionError, Result};
use crate::session::{ExitStatus, RawOutput, Session};

/// Classified result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Real nonzero exit code
    CommandFailure(i32),
    /// Terminated by the named signal; the command's own answer is unknown
    ChannelInterrupted(String),
}

impl Outcome {
    pub fn classify(status: &ExitStatus) -> Self {
        match status {
            ExitStatus::Code(0) => Self::Success,
            ExitStatus::Code(code) => Self::CommandFailure(*code),
            ExitStatus::Signal(signal) => Self::ChannelInterrupted(signal.clone()),
        }
    }
}

/// Output and outcome of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub outcome: Outcome,
}

impl CommandResult {
    fn from_raw(raw: RawOutput) -> Self {
        Self {
            outcome: Outcome::classify(&raw.status),
            stdout: raw.stdout,
            stderr: raw.stderr,
        }
    }
}

/// Answer to a yes/no question asked through a command's exit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Yes,
    No,
    /// The probe was killed by this signal; the answer is unknown
    Inconclusive(String),
}

impl From<&Outcome> for Probe {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Success => Self::Yes,
            Outcome::CommandFailure(_) => Self::No,
            Outcome::ChannelInterrupted(signal) => Self::Inconclusive(signal.clone()),
        }
    }
}

/// Runs typed commands over an exclusively owned session.
pub struct CommandRunner {
    session: Box<dyn Session>,
    dry_run: bool,
    closed: bool,
    commands_run: usize,
}

impl std::fmt::Debug for CommandRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRunner")
            .field("dry_run", &self.dry_run)
            .field("closed", &self.closed)
            .field("commands_run", &self.commands_run)
            .finish_non_exhaustive()
    }
}

impl CommandRunner {
    pub fn new(session: Box<dyn Session>) -> Self {
        Self {
            session,
            dry_run: false,
            closed: false,
            commands_run: 0,
        }
    }

    /// In dry-run mode mutating commands are logged and reported as successful
    /// without being sent; read-only commands still run so probes are real.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Number of commands actually sent to the remote machine.
    pub fn commands_run(&self) -> usize {
        self.commands_run
    }

    /// Run `command` and classify the result. `Err` only for channel failures.
    pub fn run(&mut self, command: &RemoteCommand) -> Result<CommandResult> {
        if self.closed {
            return Err(ProvisionError::channel("session already closed"));
        }
        if self.dry_run && command.is_mutating() {
            tracing::info!("[dry-run] would run: {}", command);
            return Ok(CommandResult {
                stdout: command.dry_run_stdout().to_string(),
                stderr: String::new(),
                outcome: Outcome::Success,
            });
        }

        tracing::debug!("Running: {}", command);
        let raw = self.session.run(command)?;
        self.commands_run += 1;
        let result = CommandResult::from_raw(raw);
        if let Outcome::ChannelInterrupted(signal) = &result.outcome {
            tracing::warn!("Command `{}` was interrupted by {}", command, signal);
        }
        Ok(result)
    }

    /// Run `command` and require success.
    pub fn check(&mut self, command: &RemoteCommand) -> Result<CommandResult> {
        let result = self.run(command)?;
        match &result.outcome {
            Outcome::Success => Ok(result),
            Outcome::CommandFailure(code) => {
                tracing::error!(
                    "Command `{}` failed with exit code {}\nstdout: {}\nstderr: {}",
                    command,
                    code,
                    result.stdout.trim(),
                    result.stderr.trim()
                );
                Err(ProvisionError::CommandFailed {
                    command: command.render(),
                    code: *code,
                    stderr: result.stderr.trim().to_string(),
                })
            }
            Outcome::ChannelInterrupted(signal) => Err(ProvisionError::ChannelInterrupted {
                command: command.render(),
                signal: signal.clone(),
            }),
        }
    }

    /// Run `command` and require success, returning trimmed stdout.
    pub fn capture(&mut self, command: &RemoteCommand) -> Result<String> {
        Ok(self.check(command)?.stdout.trim().to_string())
    }

    /// Ask a yes/no question through the exit status of `command`.
    pub fn probe(&mut self, command: &RemoteCommand) -> Result<Probe> {
        let result = self.run(command)?;
        Ok(Probe::from(&result.outcome))
    }

    /// Probe for `path`, refusing to guess when the probe is interrupted.
    pub fn path_exists(&mut self, path: &str) -> Result<bool> {
        let command = RemoteCommand::PathExists {
            path: path.to_string(),
        };
        match self.probe(&command)? {
            Probe::Yes => Ok(true),
            Probe::No => Ok(false),
            Probe::Inconclusive(signal) => Err(ProvisionError::ChannelInterrupted {
                command: command.render(),
                signal,
            }),
        }
    }

    /// Close the session. Later commands fail with a channel error.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.session.close()
    }
}

impl Drop for CommandRunner {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close session: {}", e);
        }
    }
}

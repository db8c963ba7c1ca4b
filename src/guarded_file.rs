//! Crash-safe file replacement on the remote machine.
//!
//! A `GuardedFile` pairs a remote path with a sentinel, `<path>.finished`.
//! The sentinel is created only after the file has been written completely,
//! so after any crash the file is in exactly one of two states:
//!
//! ```text
//! absent                    -> not started, write it
//! present + sentinel        -> done, leave it alone
//! present, no sentinel      -> interrupted, delete and write again
//! ```
//!
//! Re-writing is always safe because the source is never modified by the
//! protocol. The same protocol makes one-time backups (`<path>.bak`) and
//! scratch copies used to edit a file before moving it into place.

use crate::command::RemoteCommand;
use crate::error::Result;
use crate::runner::CommandRunner;

/// Suffix of the completion sentinel.
pub const SENTINEL_SUFFIX: &str = ".finished";

/// Suffix of one-time backups.
pub const BACKUP_SUFFIX: &str = ".bak";

/// What `copy_from` found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    /// File and sentinel were present; nothing was run
    AlreadyComplete,
    /// File was absent and has been written
    Applied,
    /// File was present without its sentinel; it was discarded and rewritten
    Recovered,
}

/// A remote file whose writes are proven complete by a sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedFile {
    path: String,
}

impl GuardedFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// The guarded backup of `original` (`<original>.bak`).
    pub fn backup_of(original: &str) -> Self {
        Self::new(format!("{}{}", original, BACKUP_SUFFIX))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn sentinel(&self) -> String {
        format!("{}{}", self.path, SENTINEL_SUFFIX)
    }

    /// Make this file a complete copy of `source`.
    ///
    /// An interrupted existence probe is an error: with the state unknown,
    /// both skipping and deleting could be wrong.
    pub fn copy_from(&self, runner: &mut CommandRunner, source: &str) -> Result<GuardOutcome> {
        let sentinel = self.sentinel();
        let mut recovered = false;

        if runner.path_exists(&self.path)? {
            if runner.path_exists(&sentinel)? {
                tracing::debug!("{} is already complete", self.path);
                return Ok(GuardOutcome::AlreadyComplete);
            }
            tracing::warn!(
                "{} exists without {}; a previous write was interrupted, discarding it",
                self.path,
                sentinel
            );
            runner.check(&RemoteCommand::Remove {
                path: self.path.clone(),
            })?;
            runner.check(&RemoteCommand::Remove {
                path: sentinel.clone(),
            })?;
            recovered = true;
        } else if runner.path_exists(&sentinel)? {
            // A stale sentinel would vouch for a half-written copy
            tracing::warn!("Removing stale sentinel {} for absent {}", sentinel, self.path);
            runner.check(&RemoteCommand::Remove {
                path: sentinel.clone(),
            })?;
        }

        runner.check(&RemoteCommand::Copy {
            from: source.to_string(),
            to: self.path.clone(),
        })?;
        runner.check(&RemoteCommand::Touch { path: sentinel })?;

        if recovered {
            Ok(GuardOutcome::Recovered)
        } else {
            Ok(GuardOutcome::Applied)
        }
    }

    /// Drop the sentinel and move the file to `dest`.
    pub fn move_into_place(&self, runner: &mut CommandRunner, dest: &str) -> Result<()> {
        runner.check(&RemoteCommand::Remove {
            path: self.sentinel(),
        })?;
        runner.check(&RemoteCommand::Move {
            from: self.path.clone(),
            to: dest.to_string(),
        })?;
        Ok(())
    }
}

/// Make a one-time guarded backup of `original` at `<original>.bak`.
///
/// Once the backup is complete it is never overwritten, so it keeps the
/// contents from before hostseed first touched the file.
pub fn backup(runner: &mut CommandRunner, original: &str) -> Result<GuardedFile> {
    let backup = GuardedFile::backup_of(original);
    match backup.copy_from(runner, original)? {
        GuardOutcome::AlreadyComplete => {
            tracing::info!("Backup {} already exists", backup.path())
        }
        GuardOutcome::Applied => tracing::info!("Backed up {} to {}", original, backup.path()),
        GuardOutcome::Recovered => tracing::info!(
            "Recreated interrupted backup {} from {}",
            backup.path(),
            original
        ),
    }
    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let file = GuardedFile::backup_of("/etc/apt/apt.conf.d/50unattended-upgrades");
        assert_eq!(file.path(), "/etc/apt/apt.conf.d/50unattended-upgrades.bak");
        assert_eq!(
            file.sentinel(),
            "/etc/apt/apt.conf.d/50unattended-upgrades.bak.finished"
        );
    }
}

//! Uploading local files to the remote machine.
//!
//! Uploads land under a `.partial` name and are renamed only after the
//! remote SHA-256 matches the local one, so a listed tarball is always
//! complete.

use crate::command::RemoteCommand;
use crate::digest::Sha256Digest;
use crate::error::{ProvisionError, Result};
use crate::process_guard;
use crate::runner::CommandRunner;
use crate::session::{ExitStatus, SshTarget};
use std::path::Path;
use std::process::{Command, Stdio};

/// Suffix of an upload in progress
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Extension of uploaded tarballs
pub const TARBALL_EXTENSION: &str = ".tar.gz";

/// File transfer channel.
pub trait Transfer {
    /// Copy `local` to `remote_path` on the remote machine.
    fn transfer(&mut self, local: &Path, remote_path: &str) -> Result<()>;
}

/// `scp` with the same target options as the ssh session.
#[derive(Debug, Clone)]
pub struct ScpTransfer {
    target: SshTarget,
}

impl ScpTransfer {
    pub fn new(target: SshTarget) -> Self {
        Self { target }
    }
}

impl Transfer for ScpTransfer {
    fn transfer(&mut self, local: &Path, remote_path: &str) -> Result<()> {
        let mut cmd = Command::new("scp");
        self.target.configure(&mut cmd, "-P");
        cmd.arg("-q")
            .arg("--")
            .arg(local)
            .arg(format!("{}:{}", self.target.destination(), remote_path))
            .stdin(Stdio::null());

        tracing::debug!("scp {:?} -> {}:{}", local, self.target, remote_path);
        let output = process_guard::output_guarded(&mut cmd)
            .map_err(|e| ProvisionError::transfer(format!("failed to run scp: {}", e)))?;
        if !output.status.success() {
            return Err(ProvisionError::transfer(format!(
                "scp to {} ended with {}: {}",
                self.target,
                ExitStatus::from_process(output.status),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Upload `local` into `remote_dir` and verify it. Returns the remote path.
pub fn upload_verified(
    runner: &mut CommandRunner,
    transfer: &mut dyn Transfer,
    local: &Path,
    remote_dir: &str,
) -> Result<String> {
    let name = local
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ProvisionError::transfer(format!("{:?} has no file name", local)))?;
    let expected = Sha256Digest::of_file(local)?;
    let remote_path = format!("{}/{}", remote_dir.trim_end_matches('/'), name);
    let partial = format!("{}{}", remote_path, PARTIAL_SUFFIX);

    runner.check(&RemoteCommand::MakeDir {
        path: remote_dir.to_string(),
    })?;

    if runner.is_dry_run() {
        tracing::info!("[dry-run] would upload {:?} to {}", local, remote_path);
        return Ok(remote_path);
    }

    tracing::info!("Uploading {:?} to {}", local, partial);
    transfer.transfer(local, &partial)?;

    let output = runner.capture(&RemoteCommand::Sha256 {
        path: partial.clone(),
    })?;
    let actual = Sha256Digest::from_sha256sum_output(&output)?;
    if actual != expected {
        if let Err(e) = runner.check(&RemoteCommand::Remove {
            path: partial.clone(),
        }) {
            tracing::warn!("Failed to remove corrupt upload {}: {}", partial, e);
        }
        return Err(ProvisionError::integrity(
            format!("uploaded {}", name),
            expected.as_str(),
            actual.as_str(),
        ));
    }

    runner.check(&RemoteCommand::Move {
        from: partial,
        to: remote_path.clone(),
    })?;
    tracing::info!("Uploaded {} (sha256 {})", remote_path, expected);
    Ok(remote_path)
}

/// Names of the complete tarballs in `remote_dir`, sorted.
pub fn list_tarballs(runner: &mut CommandRunner, remote_dir: &str) -> Result<Vec<String>> {
    if !runner.path_exists(remote_dir)? {
        return Ok(Vec::new());
    }
    let listing = runner.capture(&RemoteCommand::ListDir {
        path: remote_dir.to_string(),
    })?;
    let mut names: Vec<String> = listing
        .lines()
        .map(str::trim)
        .filter(|name| name.ends_with(TARBALL_EXTENSION))
        .map(str::to_string)
        .collect();
    names.sort();
    Ok(names)
}

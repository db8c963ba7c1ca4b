//! Checksum-verified binary installation.
//!
//! An artifact carries two checksums. The tarball checksum gates every fresh
//! download: nothing is unpacked until it matches. The binary checksum
//! decides whether the installed file can be trusted, so a re-run detects a
//! corrupted or half-copied binary even after the tarball is long gone.

use crate::command::RemoteCommand;
use crate::digest::Sha256Digest;
use crate::error::{ProvisionError, Result};
use crate::runner::{CommandRunner, Probe};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A downloadable binary and what it must hash to.
///
/// # Example
///
/// ```json
/// {
///   "name": "pack",
///   "url": "https://github.com/buildpacks/pack/releases/download/v0.28.0/pack-v0.28.0-linux.tgz",
///   "tarball_sha256": "<sha256 of the .tgz>",
///   "binary_sha256": "<sha256 of the extracted pack binary>",
///   "binary_in_tarball": "pack",
///   "install_path": "/usr/local/bin/pack"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifiedArtifact {
    pub name: String,
    pub url: String,
    pub tarball_sha256: Sha256Digest,
    pub binary_sha256: Sha256Digest,
    /// Path of the binary relative to the tarball root
    pub binary_in_tarball: String,
    /// Absolute remote path the binary is installed to
    pub install_path: String,
}

impl VerifiedArtifact {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProvisionError::validation("artifact name is empty"));
        }
        if !self.url.starts_with("https://") {
            return Err(ProvisionError::validation(format!(
                "artifact {}: url must use https, got '{}'",
                self.name, self.url
            )));
        }
        if !self.install_path.starts_with('/') {
            return Err(ProvisionError::validation(format!(
                "artifact {}: install_path must be absolute, got '{}'",
                self.name, self.install_path
            )));
        }
        let inner = self.binary_in_tarball.as_str();
        if inner.is_empty() || inner.starts_with('/') || inner.split('/').any(|part| part == "..")
        {
            return Err(ProvisionError::validation(format!(
                "artifact {}: binary_in_tarball must be a relative path inside the tarball, \
                 got '{}'",
                self.name, inner
            )));
        }
        Ok(())
    }

    /// File name the tarball is saved under in the scratch directory.
    pub fn tarball_file_name(&self) -> &str {
        self.url
            .rsplit('/')
            .next()
            .map(|name| name.split(['?', '#']).next().unwrap_or(name))
            .filter(|name| !name.is_empty())
            .unwrap_or("artifact.tgz")
    }
}

/// What `ensure_artifact_installed` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactOutcome {
    /// The installed binary already matched; nothing was downloaded
    AlreadyInstalled,
    /// Nothing was installed before; the verified binary is now in place
    Installed,
    /// A binary with the wrong checksum was replaced
    Replaced,
    /// Dry run: the download was needed but not performed
    Planned,
}

/// Ensure the binary at `artifact.install_path` matches `binary_sha256`,
/// downloading and verifying the tarball when it does not.
pub fn ensure_artifact_installed(
    runner: &mut CommandRunner,
    artifact: &VerifiedArtifact,
    download_timeout: Duration,
) -> Result<ArtifactOutcome> {
    let present = match runner.probe(&RemoteCommand::PathExists {
        path: artifact.install_path.clone(),
    })? {
        Probe::Yes => true,
        Probe::No => false,
        Probe::Inconclusive(signal) => {
            // A fresh verified install is always safe
            tracing::warn!(
                "Existence check for {} interrupted by {}; reinstalling",
                artifact.install_path,
                signal
            );
            false
        }
    };

    if present {
        let actual = remote_sha256(runner, &artifact.install_path)?;
        if actual == artifact.binary_sha256 {
            tracing::info!(
                "{} is already installed at {}",
                artifact.name,
                artifact.install_path
            );
            return Ok(ArtifactOutcome::AlreadyInstalled);
        }
        tracing::warn!(
            "{} at {} has sha256 {}, expected {}; reinstalling",
            artifact.name,
            artifact.install_path,
            actual,
            artifact.binary_sha256
        );
    }

    if runner.is_dry_run() {
        tracing::info!(
            "[dry-run] would download {} and install it to {}",
            artifact.url,
            artifact.install_path
        );
        return Ok(ArtifactOutcome::Planned);
    }

    let scratch = runner.capture(&RemoteCommand::MakeTempDir)?;
    if !scratch.starts_with('/') {
        return Err(ProvisionError::channel(format!(
            "mktemp -d returned '{}'",
            scratch
        )));
    }

    let installed = install_from(runner, artifact, &scratch, download_timeout);
    if let Err(e) = runner.check(&RemoteCommand::RemoveTree {
        path: scratch.clone(),
    }) {
        tracing::warn!("Failed to remove scratch directory {}: {}", scratch, e);
    }
    installed?;

    tracing::info!("{} installed at {}", artifact.name, artifact.install_path);
    if present {
        Ok(ArtifactOutcome::Replaced)
    } else {
        Ok(ArtifactOutcome::Installed)
    }
}

/// Download, verify, unpack, verify, install. Nothing reaches the install
/// path unless both checksums matched.
fn install_from(
    runner: &mut CommandRunner,
    artifact: &VerifiedArtifact,
    scratch: &str,
    download_timeout: Duration,
) -> Result<()> {
    let tarball = format!("{}/{}", scratch, artifact.tarball_file_name());
    tracing::info!("Downloading {}", artifact.url);
    runner.check(&RemoteCommand::Download {
        url: artifact.url.clone(),
        dest: tarball.clone(),
        timeout_secs: download_timeout.as_secs().max(1),
    })?;

    let actual = remote_sha256(runner, &tarball)?;
    if actual != artifact.tarball_sha256 {
        tracing::error!(
            "{} tarball is corrupt, or someone is doing something sneaky",
            artifact.name
        );
        return Err(ProvisionError::integrity(
            format!("{} tarball ({})", artifact.name, artifact.url),
            artifact.tarball_sha256.as_str(),
            actual.as_str(),
        ));
    }

    let unpack_dir = format!("{}/unpacked", scratch);
    runner.check(&RemoteCommand::MakeDir {
        path: unpack_dir.clone(),
    })?;
    runner.check(&RemoteCommand::Untar {
        archive: tarball,
        dir: unpack_dir.clone(),
    })?;

    let extracted = format!("{}/{}", unpack_dir, artifact.binary_in_tarball);
    let actual = remote_sha256(runner, &extracted)?;
    if actual != artifact.binary_sha256 {
        return Err(ProvisionError::integrity(
            format!("{} binary {}", artifact.name, artifact.binary_in_tarball),
            artifact.binary_sha256.as_str(),
            actual.as_str(),
        ));
    }

    // mv carries the mode, so the install path never holds a non-executable binary
    runner.check(&RemoteCommand::SetMode {
        path: extracted.clone(),
        mode: 0o755,
    })?;
    runner.check(&RemoteCommand::Move {
        from: extracted,
        to: artifact.install_path.clone(),
    })?;
    Ok(())
}

/// SHA-256 of a remote file.
pub fn remote_sha256(runner: &mut CommandRunner, path: &str) -> Result<Sha256Digest> {
    let output = runner.capture(&RemoteCommand::Sha256 {
        path: path.to_string(),
    })?;
    Sha256Digest::from_sha256sum_output(&output)
}

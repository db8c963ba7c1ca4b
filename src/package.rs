//! Idempotent package installation through apt/dpkg.
//!
//! A package is installed only when dpkg's own records say it is missing.
//! An installed package is never handed back to apt, so a re-run cannot
//! trigger an upgrade of something that already works.

use crate::command::RemoteCommand;
use crate::error::{ProvisionError, Result};
use crate::runner::{CommandRunner, Outcome};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// dpkg status string of a fully installed package.
const INSTALLED_STATUS: &str = "install ok installed";

/// A Debian package name (`[a-z0-9][a-z0-9+.-]+`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageName(String);

impl PackageName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PackageName {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        let valid_first = chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        let valid_rest = chars.all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '-' | '.')
        });
        if !valid_first || !valid_rest || s.len() < 2 {
            return Err(ProvisionError::validation(format!(
                "invalid package name '{}'",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for PackageName {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PackageName> for String {
    fn from(name: PackageName) -> Self {
        name.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What `ensure_installed` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageOutcome {
    /// dpkg already had the package; nothing was run
    AlreadyInstalled,
    /// The install command ran and succeeded
    Installed,
}

/// Ask dpkg whether `package` is installed.
///
/// Returns `None` when the query was interrupted by a signal and the answer
/// is unknown.
pub fn is_installed(runner: &mut CommandRunner, package: &PackageName) -> Result<Option<bool>> {
    let result = runner.run(&RemoteCommand::PackageStatus {
        package: package.clone(),
    })?;
    match result.outcome {
        Outcome::Success => Ok(Some(result.stdout.trim() == INSTALLED_STATUS)),
        // dpkg-query exits 1 for packages it has never heard of
        Outcome::CommandFailure(_) => Ok(Some(false)),
        Outcome::ChannelInterrupted(signal) => {
            tracing::warn!(
                "Installed check for {} was interrupted by {}; treating as not installed",
                package,
                signal
            );
            Ok(None)
        }
    }
}

/// Install `package` unless dpkg already reports it installed.
pub fn ensure_installed(
    runner: &mut CommandRunner,
    package: &PackageName,
) -> Result<PackageOutcome> {
    if is_installed(runner, package)? == Some(true) {
        tracing::info!("{} is already installed, skipping", package);
        return Ok(PackageOutcome::AlreadyInstalled);
    }

    tracing::info!("Installing {}", package);
    runner.check(&RemoteCommand::InstallPackage {
        package: package.clone(),
    })?;
    tracing::info!("{} installed", package);
    Ok(PackageOutcome::Installed)
}

/// Refresh the apt package index.
pub fn refresh_index(runner: &mut CommandRunner) -> Result<()> {
    runner.check(&RemoteCommand::RefreshPackageIndex)?;
    Ok(())
}

/// Feed one debconf selection line (`<owner> <question> <type> <value>`).
pub fn preseed(runner: &mut CommandRunner, selection: &str) -> Result<()> {
    if selection.split_whitespace().count() < 4 {
        return Err(ProvisionError::validation(format!(
            "debconf selection '{}' must be '<owner> <question> <type> <value>'",
            selection
        )));
    }
    runner.check(&RemoteCommand::DebconfSet {
        selection: selection.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_package_names() {
        for name in ["curl", "docker.io", "iptables-persistent", "g++", "0ad", "libc6"] {
            assert!(name.parse::<PackageName>().is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn test_invalid_package_names() {
        for name in ["", "a", "Curl", "-curl", "curl;reboot", "curl bash", "pkg$(id)"] {
            assert!(name.parse::<PackageName>().is_err(), "{:?} should be invalid", name);
        }
    }

    #[test]
    fn test_package_name_serde() {
        let name: PackageName = serde_json::from_str("\"curl\"").expect("valid");
        assert_eq!(name.as_str(), "curl");
        let bad: std::result::Result<PackageName, _> = serde_json::from_str("\"rm -rf\"");
        assert!(bad.is_err());
    }
}

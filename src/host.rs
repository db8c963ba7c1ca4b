//! Remote host verification.
//!
//! Provisioning only targets the release and architecture it was written
//! for. Both are read from the remote machine before anything is changed.

use crate::command::RemoteCommand;
use crate::error::{ProvisionError, Result};
use crate::runner::CommandRunner;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// `/etc/os-release` on the remote machine
pub const OS_RELEASE_PATH: &str = "/etc/os-release";

/// CPU architecture as reported by `uname -m`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
pub enum Architecture {
    #[default]
    #[strum(serialize = "x86_64")]
    #[serde(rename = "x86_64")]
    X86_64,
    #[strum(serialize = "aarch64")]
    #[serde(rename = "aarch64")]
    Aarch64,
}

/// The fields of `/etc/os-release` the checks need
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OsRelease {
    pub id: String,
    pub version_id: String,
    pub pretty_name: String,
}

impl OsRelease {
    /// Parse `KEY=value` lines, unquoting values. Unknown keys are ignored.
    pub fn parse(content: &str) -> Self {
        let mut release = Self::default();
        for line in content.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'').to_string();
            match key.trim() {
                "ID" => release.id = value,
                "VERSION_ID" => release.version_id = value,
                "PRETTY_NAME" => release.pretty_name = value,
                _ => {}
            }
        }
        release
    }
}

/// What the remote machine must be
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostRequirements {
    /// `ID` from os-release
    pub os_id: String,
    /// `VERSION_ID` from os-release
    pub version_id: String,
    pub architecture: Architecture,
}

impl Default for HostRequirements {
    fn default() -> Self {
        Self {
            os_id: "ubuntu".to_string(),
            version_id: "22.04".to_string(),
            architecture: Architecture::X86_64,
        }
    }
}

/// Read and check the remote OS release.
pub fn verify_os(runner: &mut CommandRunner, requirements: &HostRequirements) -> Result<OsRelease> {
    let content = runner.capture(&RemoteCommand::ReadFile {
        path: OS_RELEASE_PATH.to_string(),
    })?;
    let release = OsRelease::parse(&content);
    tracing::info!(
        "Remote OS: {}",
        if release.pretty_name.is_empty() {
            &release.id
        } else {
            &release.pretty_name
        }
    );

    if release.id != requirements.os_id || release.version_id != requirements.version_id {
        return Err(ProvisionError::unsupported_host(format!(
            "hostseed only supports {} {}, found {} {}",
            requirements.os_id, requirements.version_id, release.id, release.version_id
        )));
    }
    Ok(release)
}

/// Read and check the remote CPU architecture.
pub fn verify_architecture(
    runner: &mut CommandRunner,
    requirements: &HostRequirements,
) -> Result<Architecture> {
    let reported = runner.capture(&RemoteCommand::MachineArch)?;
    match reported.parse::<Architecture>() {
        Ok(arch) if arch == requirements.architecture => {
            tracing::info!("Remote architecture: {}", arch);
            Ok(arch)
        }
        _ => Err(ProvisionError::unsupported_host(format!(
            "hostseed only supports {}, found {}",
            requirements.architecture, reported
        ))),
    }
}

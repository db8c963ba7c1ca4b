//! Provisioning configuration.
//!
//! Loaded from a JSON file (every field optional), then overridden by CLI
//! flags. Values are validated once, before any connection is opened.

use crate::artifact::VerifiedArtifact;
use crate::firewall::DEFAULT_TCP_PORTS;
use crate::host::HostRequirements;
use crate::package::PackageName;
use crate::session::{ConnectOptions, SshTarget};
use crate::upgrades::RebootTime;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Packages installed by `setup`
pub const DEFAULT_PACKAGES: [&str; 4] = [
    "docker.io",
    "curl",
    "iptables-persistent",
    "unattended-upgrades",
];

/// Remote directory uploaded tarballs are kept in
pub const DEFAULT_TARBALL_DIR: &str = "/var/lib/hostseed/tarballs";

/// Everything a provisioning run needs to know
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionConfig {
    // Connection
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Defaults to `$HOME/.ssh/id_rsa` when that file exists
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,

    // Provisioning
    pub host_requirements: HostRequirements,
    /// TCP ports opened in the firewall besides ssh
    pub tcp_ports: Vec<u16>,
    pub packages: Vec<PackageName>,
    /// Required by `setup`; may come from `--reboot-time` instead
    pub reboot_time: Option<RebootTime>,
    pub artifacts: Vec<VerifiedArtifact>,
    pub download_timeout_secs: u64,

    // Tarballs
    pub tarball_dir: String,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            user: "root".to_string(),
            identity_file: None,
            connect_timeout_secs: 5,
            host_requirements: HostRequirements::default(),
            tcp_ports: DEFAULT_TCP_PORTS.to_vec(),
            packages: DEFAULT_PACKAGES
                .iter()
                .filter_map(|name| name.parse().ok())
                .collect(),
            reboot_time: None,
            artifacts: Vec::new(),
            download_timeout_secs: 300,
            tarball_dir: DEFAULT_TARBALL_DIR.to_string(),
        }
    }
}

impl ProvisionConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate connection settings
    pub fn validate_connection(&self) -> Result<()> {
        let host = self.host.trim();
        if host.is_empty() {
            anyhow::bail!("Host must be specified (--host or \"host\" in the config file)");
        }
        if host.starts_with('-') || host.contains(char::is_whitespace) || host.contains('@') {
            anyhow::bail!("Host '{}' is not a valid host name or address", host);
        }
        if self.port == 0 {
            anyhow::bail!("Port must be between 1 and 65535");
        }

        let user = self.user.trim();
        if user.is_empty() {
            anyhow::bail!("User must be specified");
        }
        if user.starts_with('-')
            || !user
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            anyhow::bail!("User '{}' is not a valid user name", user);
        }

        if self.connect_timeout_secs == 0 {
            anyhow::bail!("Connect timeout must be at least one second");
        }
        if let Some(identity) = &self.identity_file {
            if !identity.is_file() {
                anyhow::bail!("Identity file {:?} does not exist", identity);
            }
        }
        Ok(())
    }

    /// Validate everything `setup` uses
    pub fn validate(&self) -> Result<()> {
        self.validate_connection()?;

        if self.tcp_ports.contains(&0) {
            anyhow::bail!("TCP port 0 is not allowed");
        }
        if self.download_timeout_secs == 0 {
            anyhow::bail!("Download timeout must be at least one second");
        }
        if self.reboot_time.is_none() {
            anyhow::bail!(
                "Reboot time must be specified \
                 (--reboot-time HH:MM or \"reboot_time\" in the config file)"
            );
        }
        if !self.tarball_dir.starts_with('/') {
            anyhow::bail!("Tarball directory must be an absolute path");
        }

        let mut install_paths = std::collections::HashSet::new();
        for artifact in &self.artifacts {
            artifact
                .validate()
                .with_context(|| format!("Invalid artifact '{}'", artifact.name))?;
            if !install_paths.insert(artifact.install_path.as_str()) {
                anyhow::bail!(
                    "More than one artifact installs to {}",
                    artifact.install_path
                );
            }
        }
        Ok(())
    }

    /// Identity file to use: the configured one, else `$HOME/.ssh/id_rsa` if present
    pub fn resolved_identity_file(&self) -> Option<PathBuf> {
        self.identity_file.clone().or_else(|| {
            let default = PathBuf::from(std::env::var_os("HOME")?)
                .join(".ssh")
                .join("id_rsa");
            default.is_file().then_some(default)
        })
    }

    pub fn ssh_target(&self) -> SshTarget {
        SshTarget {
            user: self.user.trim().to_string(),
            host: self.host.trim().to_string(),
            port: self.port,
            identity_file: self.resolved_identity_file(),
        }
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            target: self.ssh_target(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

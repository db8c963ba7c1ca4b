use crate::config::ProvisionConfig;
use crate::firewall;
use crate::upgrades::RebootTime;
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// hostseed - idempotent server provisioning over ssh
#[derive(Parser)]
#[command(name = "hostseed")]
#[command(about = "Sets up and maintains a server over ssh. Every command is safe to run again.")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// Commands that change the server are logged and skipped. Read-only
    /// checks (file existence, package status, checksums) still run so the
    /// preview reflects the server's real state.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Set up everything the server needs. Safe to run again, even after a failure.
    Setup {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Time for reboots required by security updates, e.g. 02:00 for 2 AM.
        /// The server may be in a different timezone than you!
        #[arg(long)]
        reboot_time: Option<RebootTime>,

        /// Comma separated TCP ports to open besides ssh (default 80,443,444)
        #[arg(long)]
        tcp_ports: Option<String>,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
    /// Work with the source releases ("tarballs") on your server
    Tarballs {
        #[command(subcommand)]
        command: TarballCommands,
    },
}

#[derive(Subcommand)]
pub enum TarballCommands {
    /// Pack a directory into a tarball and upload it to your server
    Upload {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Directory to pack (default: current directory)
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// List the tarballs uploaded to your server
    List {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

/// Where the server is and how to log in
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// JSON configuration file; flags override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host name or IP address of your server
    #[arg(long)]
    pub host: Option<String>,

    /// Port of the ssh daemon on your server (default 22)
    #[arg(long)]
    pub port: Option<u16>,

    /// User to log in as (default root)
    #[arg(long)]
    pub user: Option<String>,

    /// Private key file. Defaults to $HOME/.ssh/id_rsa.
    #[arg(long)]
    pub key: Option<PathBuf>,
}

impl ConnectionArgs {
    /// Load the config file (if any) and apply flag overrides.
    pub fn resolve(&self) -> Result<ProvisionConfig> {
        let mut config = match &self.config {
            Some(path) => ProvisionConfig::load_from_file(path)?,
            None => ProvisionConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(user) = &self.user {
            config.user = user.clone();
        }
        if let Some(key) = &self.key {
            config.identity_file = Some(key.clone());
        }
        Ok(config)
    }
}

/// Resolve the full configuration for `setup`.
pub fn resolve_setup(
    connection: &ConnectionArgs,
    reboot_time: Option<RebootTime>,
    tcp_ports: Option<&str>,
) -> Result<ProvisionConfig> {
    let mut config = connection.resolve()?;
    if reboot_time.is_some() {
        config.reboot_time = reboot_time;
    }
    if let Some(ports) = tcp_ports {
        config.tcp_ports = firewall::parse_ports(ports)?;
    }
    Ok(config)
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

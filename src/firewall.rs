//! iptables rule set: build, load, persist.
//!
//! The rule set accepts established traffic, new TCP connections on the
//! configured ports, ssh, and loopback, and rejects everything else.
//! Loading goes through `iptables-restore`, which replaces the filter table
//! atomically, so loading twice leaves the same rules.

use crate::command::{IpFamily, RemoteCommand};
use crate::error::{ProvisionError, Result};
use crate::package;
use crate::runner::{CommandRunner, Outcome};

/// Directory iptables-persistent restores rules from at boot
pub const RULES_DIR: &str = "/etc/iptables";

/// iptables allows at most 15 ports per `multiport` match
const MULTIPORT_LIMIT: usize = 15;

/// debconf answers that stop iptables-persistent from prompting
pub const AUTOSAVE_SELECTIONS: [&str; 2] = [
    "iptables-persistent iptables-persistent/autosave_v4 boolean true",
    "iptables-persistent iptables-persistent/autosave_v6 boolean true",
];

/// Default TCP ports opened besides ssh
pub const DEFAULT_TCP_PORTS: [u16; 3] = [80, 443, 444];

/// Parse a comma separated port list such as `80,443,444`.
pub fn parse_ports(input: &str) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let port: u16 = part
            .parse()
            .map_err(|_| ProvisionError::validation(format!("invalid TCP port '{}'", part)))?;
        if port == 0 {
            return Err(ProvisionError::validation("TCP port 0 is not allowed"));
        }
        ports.push(port);
    }
    Ok(ports)
}

/// The TCP ports to open. The ssh port is always open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallPolicy {
    ssh_port: u16,
    tcp_ports: Vec<u16>,
}

impl FirewallPolicy {
    pub fn new(ssh_port: u16, tcp_ports: &[u16]) -> Self {
        let mut ports: Vec<u16> = tcp_ports
            .iter()
            .copied()
            .filter(|&p| p != 0 && p != ssh_port)
            .collect();
        ports.sort_unstable();
        ports.dedup();
        Self {
            ssh_port,
            tcp_ports: ports,
        }
    }

    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    /// Opened ports other than ssh, sorted and deduplicated
    pub fn tcp_ports(&self) -> &[u16] {
        &self.tcp_ports
    }

    /// Render the filter table in `iptables-restore` format.
    pub fn render(&self) -> String {
        let mut rules = vec![
            "*filter".to_string(),
            ":INPUT ACCEPT [0:0]".to_string(),
            ":FORWARD ACCEPT [0:0]".to_string(),
            ":OUTPUT ACCEPT [0:0]".to_string(),
            "-A INPUT -m state --state RELATED,ESTABLISHED -j ACCEPT".to_string(),
        ];
        for chunk in self.tcp_ports.chunks(MULTIPORT_LIMIT) {
            let list = chunk
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(",");
            rules.push(format!(
                "-A INPUT -p tcp -m state --state NEW -m tcp -m multiport --dports {} -j ACCEPT",
                list
            ));
        }
        rules.push(format!(
            "-A INPUT -p tcp -m tcp --dport {} -j ACCEPT",
            self.ssh_port
        ));
        rules.push("-A INPUT -i lo -j ACCEPT".to_string());
        rules.push("-A INPUT -j REJECT --reject-with icmp-port-unreachable".to_string());
        rules.push("COMMIT".to_string());

        let mut text = rules.join("\n");
        text.push('\n');
        text
    }
}

/// Replace the live filter table with `policy`.
pub fn load(runner: &mut CommandRunner, policy: &FirewallPolicy) -> Result<()> {
    tracing::info!(
        "Allowing TCP ports {:?} and ssh on {}",
        policy.tcp_ports(),
        policy.ssh_port()
    );
    runner.check(&RemoteCommand::RestoreFirewall {
        rules: policy.render(),
    })?;
    Ok(())
}

/// Answer iptables-persistent's autosave questions ahead of installation.
pub fn preseed_autosave(runner: &mut CommandRunner) -> Result<()> {
    for selection in AUTOSAVE_SELECTIONS {
        package::preseed(runner, selection)?;
    }
    Ok(())
}

/// Path the saved rules for `family` live at.
pub fn rules_path(family: IpFamily) -> String {
    match family {
        IpFamily::V4 => format!("{}/rules.v4", RULES_DIR),
        IpFamily::V6 => format!("{}/rules.v6", RULES_DIR),
    }
}

/// Save the live rules so they are restored at boot, then log them.
pub fn persist(runner: &mut CommandRunner) -> Result<()> {
    runner.check(&RemoteCommand::MakeDir {
        path: RULES_DIR.to_string(),
    })?;
    for family in [IpFamily::V4, IpFamily::V6] {
        let dest = rules_path(family);
        runner.check(&RemoteCommand::SaveFirewall {
            family,
            dest: dest.clone(),
        })?;

        let saved = runner.run(&RemoteCommand::ReadFile { path: dest })?;
        if saved.outcome == Outcome::Success {
            tracing::info!("{} firewall rules:\n{}", family, saved.stdout.trim_end());
        }
    }
    Ok(())
}

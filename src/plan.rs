//! The fixed `setup` plan.
//!
//! Step order matters: the host is checked before anything changes, the
//! firewall is loaded before packages open new listeners, and artifacts
//! come last because they need `curl` from the package steps.

use crate::artifact;
use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, Result};
use crate::firewall::{self, FirewallPolicy};
use crate::host;
use crate::orchestrator::Orchestrator;
use crate::package;
use crate::upgrades;

/// Package whose install prompts are answered ahead of time
const IPTABLES_PERSISTENT: &str = "iptables-persistent";

/// Build the setup plan from `config`.
pub fn setup_plan(config: &ProvisionConfig) -> Result<Orchestrator> {
    let reboot_time = config.reboot_time.ok_or_else(|| {
        ProvisionError::validation("a reboot time is required for automatic security updates")
    })?;
    let mut plan = Orchestrator::new();

    let requirements = config.host_requirements.clone();
    plan.add_step("Checking OS version of server", move |ctx| {
        host::verify_os(ctx.runner(), &requirements).map(|_| ())
    });

    let requirements = config.host_requirements.clone();
    plan.add_step("Checking architecture of server", move |ctx| {
        host::verify_architecture(ctx.runner(), &requirements).map(|_| ())
    });

    plan.add_step("Updating APT repositories", |ctx| {
        package::refresh_index(ctx.runner())
    });

    let policy = FirewallPolicy::new(config.port, &config.tcp_ports);
    plan.add_step("Loading firewall rules", move |ctx| {
        firewall::load(ctx.runner(), &policy)
    });

    if config
        .packages
        .iter()
        .any(|p| p.as_str() == IPTABLES_PERSISTENT)
    {
        plan.add_step("Answering iptables-persistent prompts", |ctx| {
            firewall::preseed_autosave(ctx.runner())
        });
    }

    for name in &config.packages {
        let name = name.clone();
        plan.add_step(format!("Installing {}", name), move |ctx| {
            package::ensure_installed(ctx.runner(), &name).map(|_| ())
        });
    }

    plan.add_step("Persisting firewall rules", |ctx| {
        firewall::persist(ctx.runner())
    });

    plan.add_step("Setting up automatic security updates", move |ctx| {
        upgrades::configure(ctx.runner(), reboot_time).map(|_| ())
    });

    for item in &config.artifacts {
        let item = item.clone();
        let timeout = config.download_timeout();
        plan.add_step(format!("Installing {}", item.name), move |ctx| {
            artifact::ensure_artifact_installed(ctx.runner(), &item, timeout).map(|_| ())
        });
    }

    Ok(plan)
}

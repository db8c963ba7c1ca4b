//! Automatic security updates through unattended-upgrades.
//!
//! The config file is never edited in place. The first run takes a one-time
//! backup, edits a guarded scratch copy, and moves the copy over the config
//! with a single `mv`, so the live file is always either the old or the new
//! version.

use crate::command::RemoteCommand;
use crate::error::{ProvisionError, Result};
use crate::guarded_file::{self, GuardOutcome, GuardedFile};
use crate::runner::CommandRunner;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Config file patched by `configure`
pub const UNATTENDED_UPGRADES_CONFIG: &str = "/etc/apt/apt.conf.d/50unattended-upgrades";

/// Suffix of the scratch copy edited before it replaces the config
const SCRATCH_SUFFIX: &str = ".hostseed-next";

/// Wall-clock time for automatic reboots, `HH:MM` in the server's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RebootTime {
    hour: u8,
    minute: u8,
}

impl RebootTime {
    pub fn new(hour: u8, minute: u8) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(ProvisionError::validation(format!(
                "reboot time {:02}:{:02} is out of range",
                hour, minute
            )));
        }
        Ok(Self { hour, minute })
    }
}

impl FromStr for RebootTime {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            ProvisionError::validation(format!(
                "reboot time '{}' must be HH:MM, e.g. 02:00 for 2 AM",
                s
            ))
        };
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        if hour.len() != 2 || minute.len() != 2 {
            return Err(invalid());
        }
        let hour = hour.parse().map_err(|_| invalid())?;
        let minute = minute.parse().map_err(|_| invalid())?;
        Self::new(hour, minute)
    }
}

impl fmt::Display for RebootTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl TryFrom<String> for RebootTime {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RebootTime> for String {
    fn from(value: RebootTime) -> Self {
        value.to_string()
    }
}

/// One `Unattended-Upgrade::<key> "<value>";` setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setting {
    pub key: &'static str,
    pub value: String,
}

impl Setting {
    fn new(key: &'static str, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    /// Text identifying the setting's line, commented out or not
    pub fn pattern(&self) -> String {
        format!("Unattended-Upgrade::{} \"", self.key)
    }

    /// The line the setting is written as
    pub fn line(&self) -> String {
        format!("Unattended-Upgrade::{} \"{}\";", self.key, self.value)
    }

    /// True when no line mentioning the setting differs from `line()`.
    pub fn is_applied(&self, content: &str) -> bool {
        let pattern = self.pattern();
        let line = self.line();
        content
            .lines()
            .filter(|l| l.contains(&pattern))
            .all(|l| l == line)
    }
}

/// Settings for automatic reboots at `reboot_time` with verbose syslog output.
pub fn settings(reboot_time: RebootTime) -> Vec<Setting> {
    vec![
        Setting::new("Automatic-Reboot", "true"),
        Setting::new("Automatic-Reboot-WithUsers", "true"),
        Setting::new("Automatic-Reboot-Time", reboot_time.to_string()),
        Setting::new("SyslogEnable", "true"),
        Setting::new("Verbose", "true"),
    ]
}

/// What `configure` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Every setting was already in place
    Unchanged,
    /// The patched copy replaced the config
    Updated,
}

/// Apply `settings` to the unattended-upgrades config.
pub fn configure(runner: &mut CommandRunner, reboot_time: RebootTime) -> Result<PatchOutcome> {
    patch_file(runner, UNATTENDED_UPGRADES_CONFIG, &settings(reboot_time))
}

/// Apply `settings` to the config at `path` through a backup and a scratch copy.
pub fn patch_file(
    runner: &mut CommandRunner,
    path: &str,
    settings: &[Setting],
) -> Result<PatchOutcome> {
    let backup = guarded_file::backup(runner, path)?;

    let current = runner.capture(&RemoteCommand::ReadFile {
        path: path.to_string(),
    })?;
    if settings.iter().all(|s| s.is_applied(&current)) {
        tracing::info!("{} is already configured", path);
        return Ok(PatchOutcome::Unchanged);
    }

    let scratch = GuardedFile::new(format!("{}{}", path, SCRATCH_SUFFIX));
    if scratch.copy_from(runner, path)? == GuardOutcome::AlreadyComplete {
        // Edits are idempotent, so a copy left by an interrupted run is reusable
        tracing::info!("Resuming edits on {}", scratch.path());
    }
    for setting in settings {
        runner.check(&RemoteCommand::replace_line(
            scratch.path(),
            setting.pattern(),
            setting.line(),
        )?)?;
    }
    scratch.move_into_place(runner, path)?;

    let diff = runner.capture(&RemoteCommand::Diff {
        left: backup.path().to_string(),
        right: path.to_string(),
    })?;
    if !diff.is_empty() {
        tracing::info!("Changes to {}:\n{}", path, diff);
    }
    Ok(PatchOutcome::Updated)
}

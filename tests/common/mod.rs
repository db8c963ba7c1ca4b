//! In-memory remote machine for integration tests.
//!
//! `FakeHost` implements `Session` by interpreting typed `RemoteCommand`s over
//! an in-memory filesystem, package database and firewall. Faults can be
//! injected per command: a signal instead of running, a signal after running
//! (the remote side finished but the channel died), or a nonzero exit code.

#![allow(dead_code)]

use hostseed::artifact::VerifiedArtifact;
use hostseed::command::RemoteCommand;
use hostseed::digest::Sha256Digest;
use hostseed::error::{ProvisionError, Result};
use hostseed::runner::CommandRunner;
use hostseed::session::{ExitStatus, RawOutput, Session};
use hostseed::transfer::Transfer;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::rc::Rc;

pub const JAMMY_OS_RELEASE: &str = r#"PRETTY_NAME="Ubuntu 22.04.3 LTS"
NAME="Ubuntu"
VERSION_ID="22.04"
VERSION="22.04.3 LTS (Jammy Jellyfish)"
ID=ubuntu
ID_LIKE=debian
"#;

/// Excerpt of the stock 50unattended-upgrades on Ubuntu 22.04
pub const STOCK_UNATTENDED_UPGRADES: &str = r#"Unattended-Upgrade::Allowed-Origins {
        "${distro_id}:${distro_codename}-security";
};
//Unattended-Upgrade::Mail "";
//Unattended-Upgrade::Remove-Unused-Dependencies "false";
//Unattended-Upgrade::Automatic-Reboot "false";
//Unattended-Upgrade::Automatic-Reboot-WithUsers "true";
//Unattended-Upgrade::Automatic-Reboot-Time "02:00";
// Unattended-Upgrade::SyslogEnable "false";
// Unattended-Upgrade::Verbose "false";
"#;

/// What an injected fault does to the matching command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultEffect {
    /// The command never runs; the channel reports this signal
    SignalBefore(String),
    /// The command runs; the channel then reports this signal
    SignalAfter(String),
    /// The command never runs and exits with this code
    Exit(i32),
}

struct Fault {
    matches: Box<dyn Fn(&RemoteCommand) -> bool>,
    effect: FaultEffect,
    remaining: usize,
}

/// A tarball served at a URL
#[derive(Debug, Clone)]
pub struct FakeArchive {
    pub bytes: Vec<u8>,
    pub entries: Vec<(String, Vec<u8>)>,
}

#[derive(Default)]
pub struct HostState {
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
    pub modes: BTreeMap<String, u32>,
    pub installed: BTreeSet<String>,
    pub unavailable: BTreeSet<String>,
    pub downloads: HashMap<String, FakeArchive>,
    pub arch: String,
    pub firewall: Option<String>,
    pub debconf: Vec<String>,
    pub log: Vec<RemoteCommand>,
    /// Number of sessions closed so far
    pub closes: usize,
    pub corrupt_uploads: bool,
    temp_counter: usize,
    faults: Vec<Fault>,
}

/// Observable state of a machine, compared before and after a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
    pub modes: BTreeMap<String, u32>,
    pub installed: BTreeSet<String>,
    pub firewall: Option<String>,
}

/// Shared handle to an in-memory machine. Clones see the same state; each
/// handle is its own session and can be closed on its own.
#[derive(Clone, Default)]
pub struct FakeHost {
    state: Rc<RefCell<HostState>>,
    closed: bool,
}

fn code(code: i32) -> RawOutput {
    RawOutput {
        stdout: String::new(),
        stderr: String::new(),
        status: ExitStatus::Code(code),
    }
}

fn ok(stdout: impl Into<String>) -> RawOutput {
    RawOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        status: ExitStatus::Code(0),
    }
}

fn fail(code: i32, stderr: &str) -> RawOutput {
    RawOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        status: ExitStatus::Code(code),
    }
}

fn parent_of(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent).filter(|p| !p.is_empty())
}

impl FakeHost {
    /// Fresh Ubuntu 22.04 x86_64 machine with nothing installed
    pub fn ubuntu() -> Self {
        let host = Self::default();
        {
            let mut state = host.state.borrow_mut();
            state.arch = "x86_64".to_string();
            for dir in [
                "/etc",
                "/etc/apt",
                "/etc/apt/apt.conf.d",
                "/tmp",
                "/usr",
                "/usr/local",
                "/usr/local/bin",
            ] {
                state.dirs.insert(dir.to_string());
            }
            state
                .files
                .insert("/etc/os-release".to_string(), JAMMY_OS_RELEASE.as_bytes().to_vec());
            state.files.insert(
                "/etc/apt/apt.conf.d/50unattended-upgrades".to_string(),
                STOCK_UNATTENDED_UPGRADES.as_bytes().to_vec(),
            );
        }
        host
    }

    /// A runner over a fresh session to this machine
    pub fn runner(&self) -> CommandRunner {
        CommandRunner::new(Box::new(self.session()))
    }

    pub fn session(&self) -> FakeHost {
        FakeHost {
            state: Rc::clone(&self.state),
            closed: false,
        }
    }

    pub fn state(&self) -> std::cell::Ref<'_, HostState> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> std::cell::RefMut<'_, HostState> {
        self.state.borrow_mut()
    }

    pub fn write_file(&self, path: &str, content: &[u8]) {
        self.state_mut().files.insert(path.to_string(), content.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    pub fn file_string(&self, path: &str) -> Option<String> {
        self.file(path).map(|b| String::from_utf8_lossy(&b).to_string())
    }

    pub fn exists(&self, path: &str) -> bool {
        let state = self.state();
        state.files.contains_key(path) || state.dirs.contains(path)
    }

    pub fn is_installed(&self, package: &str) -> bool {
        self.state().installed.contains(package)
    }

    pub fn serve(&self, url: &str, archive: FakeArchive) {
        self.state_mut().downloads.insert(url.to_string(), archive);
    }

    /// Every command received so far
    pub fn log(&self) -> Vec<RemoteCommand> {
        self.state().log.clone()
    }

    pub fn clear_log(&self) {
        self.state_mut().log.clear();
    }

    /// Commands in the log that `is_destructive` accepts
    pub fn destructive_commands(&self) -> Vec<RemoteCommand> {
        self.log().into_iter().filter(is_destructive).collect()
    }

    /// Inject a fault for the next `times` commands matching `matches`.
    pub fn fail_on<F>(&self, matches: F, effect: FaultEffect, times: usize)
    where
        F: Fn(&RemoteCommand) -> bool + 'static,
    {
        self.state_mut().faults.push(Fault {
            matches: Box::new(matches),
            effect,
            remaining: times,
        });
    }

    pub fn clear_faults(&self) {
        self.state_mut().faults.clear();
    }

    /// Files, dirs, modes, packages and firewall: everything a run can change
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state();
        Snapshot {
            files: state.files.clone(),
            dirs: state.dirs.clone(),
            modes: state.modes.clone(),
            installed: state.installed.clone(),
            firewall: state.firewall.clone(),
        }
    }

    fn take_fault(&self, command: &RemoteCommand) -> Option<FaultEffect> {
        let mut state = self.state_mut();
        let fault = state
            .faults
            .iter_mut()
            .find(|f| f.remaining > 0 && (f.matches)(command))?;
        fault.remaining -= 1;
        Some(fault.effect.clone())
    }

    fn apply(&self, command: &RemoteCommand) -> RawOutput {
        let mut guard = self.state_mut();
        let state = &mut *guard;
        match command {
            RemoteCommand::PathExists { path } => {
                let found = state.files.contains_key(path) || state.dirs.contains(path);
                code(if found { 0 } else { 1 })
            }
            RemoteCommand::Copy { from, to } => match state.files.get(from).cloned() {
                Some(content) => {
                    state.files.insert(to.clone(), content);
                    code(0)
                }
                None => fail(1, "cp: cannot stat: No such file or directory"),
            },
            RemoteCommand::Move { from, to } => match state.files.remove(from) {
                Some(content) => {
                    state.files.insert(to.clone(), content);
                    if let Some(mode) = state.modes.remove(from) {
                        state.modes.insert(to.clone(), mode);
                    }
                    code(0)
                }
                None => fail(1, "mv: cannot stat: No such file or directory"),
            },
            RemoteCommand::Remove { path } => {
                if state.dirs.contains(path) {
                    return fail(1, "rm: cannot remove: Is a directory");
                }
                state.files.remove(path);
                code(0)
            }
            RemoteCommand::RemoveTree { path } => {
                let prefix = format!("{}/", path);
                state.files.retain(|p, _| p != path && !p.starts_with(&prefix));
                state.dirs.retain(|p| p != path && !p.starts_with(&prefix));
                code(0)
            }
            RemoteCommand::Touch { path } => {
                state.files.entry(path.clone()).or_default();
                code(0)
            }
            RemoteCommand::MakeDir { path } => {
                let mut current = Some(path.as_str());
                while let Some(dir) = current {
                    state.dirs.insert(dir.to_string());
                    current = parent_of(dir);
                }
                code(0)
            }
            RemoteCommand::MakeTempDir => {
                state.temp_counter += 1;
                let dir = format!("/tmp/tmp.{:04}", state.temp_counter);
                state.dirs.insert(dir.clone());
                ok(format!("{}\n", dir))
            }
            RemoteCommand::ListDir { path } => {
                if !state.dirs.contains(path) {
                    return fail(2, "ls: cannot access: No such file or directory");
                }
                let prefix = format!("{}/", path);
                let mut names: Vec<&str> = state
                    .files
                    .keys()
                    .map(String::as_str)
                    .chain(state.dirs.iter().map(String::as_str))
                    .filter_map(|p| p.strip_prefix(&prefix))
                    .filter(|rest| !rest.contains('/'))
                    .collect();
                names.sort();
                let mut out = names.join("\n");
                out.push('\n');
                ok(out)
            }
            RemoteCommand::ReadFile { path } => match state.files.get(path) {
                Some(content) => ok(String::from_utf8_lossy(content).to_string()),
                None => fail(1, "cat: No such file or directory"),
            },
            RemoteCommand::Diff { left, right } => {
                let differs = state.files.get(left) != state.files.get(right);
                ok(if differs { "changed\n" } else { "" })
            }
            RemoteCommand::Sha256 { path } => match state.files.get(path) {
                Some(content) => ok(format!(
                    "{}  {}\n",
                    Sha256Digest::of_bytes(content).as_str(),
                    path
                )),
                None => fail(1, "sha256sum: No such file or directory"),
            },
            RemoteCommand::SetMode { path, mode } => {
                if !state.files.contains_key(path) {
                    return fail(1, "chmod: No such file or directory");
                }
                state.modes.insert(path.clone(), *mode);
                code(0)
            }
            RemoteCommand::MachineArch => ok(format!("{}\n", state.arch)),
            RemoteCommand::PackageStatus { package } => {
                if state.installed.contains(package.as_str()) {
                    ok("install ok installed")
                } else {
                    fail(1, "dpkg-query: no packages found matching")
                }
            }
            RemoteCommand::RefreshPackageIndex => code(0),
            RemoteCommand::InstallPackage { package } => {
                if state.unavailable.contains(package.as_str()) {
                    return fail(100, "E: Unable to locate package");
                }
                state.installed.insert(package.as_str().to_string());
                code(0)
            }
            RemoteCommand::DebconfSet { selection } => {
                state.debconf.push(selection.clone());
                code(0)
            }
            RemoteCommand::Download { url, dest, .. } => match state.downloads.get(url) {
                Some(archive) => {
                    let bytes = archive.bytes.clone();
                    state.files.insert(dest.clone(), bytes);
                    code(0)
                }
                None => fail(22, "curl: (22) The requested URL returned error: 404"),
            },
            RemoteCommand::Untar { archive, dir } => {
                let Some(bytes) = state.files.get(archive) else {
                    return fail(2, "tar: Cannot open: No such file or directory");
                };
                let Some(found) = state.downloads.values().find(|a| &a.bytes == bytes) else {
                    return fail(2, "tar: This does not look like a tar archive");
                };
                for (name, content) in found.entries.clone() {
                    state.files.insert(format!("{}/{}", dir, name), content);
                }
                code(0)
            }
            RemoteCommand::ReplaceLine { path, matching, line } => {
                let Some(content) = state.files.get(path) else {
                    return fail(2, "sed: can't read: No such file or directory");
                };
                let text = String::from_utf8_lossy(content).to_string();
                let mut edited: String = text
                    .lines()
                    .map(|l| if l.contains(matching.as_str()) { line.as_str() } else { l })
                    .collect::<Vec<_>>()
                    .join("\n");
                if text.ends_with('\n') {
                    edited.push('\n');
                }
                state.files.insert(path.clone(), edited.into_bytes());
                code(0)
            }
            RemoteCommand::RestoreFirewall { rules } => {
                state.firewall = Some(rules.clone());
                code(0)
            }
            RemoteCommand::SaveFirewall { dest, .. } => {
                let rules = state.firewall.clone().unwrap_or_default();
                state.files.insert(dest.clone(), rules.into_bytes());
                code(0)
            }
        }
    }
}

/// Commands a converged machine should never need again
pub fn is_destructive(command: &RemoteCommand) -> bool {
    matches!(
        command,
        RemoteCommand::Copy { .. }
            | RemoteCommand::Move { .. }
            | RemoteCommand::Remove { .. }
            | RemoteCommand::RemoveTree { .. }
            | RemoteCommand::Touch { .. }
            | RemoteCommand::MakeTempDir
            | RemoteCommand::InstallPackage { .. }
            | RemoteCommand::Download { .. }
            | RemoteCommand::Untar { .. }
            | RemoteCommand::ReplaceLine { .. }
            | RemoteCommand::SetMode { .. }
    )
}

impl Session for FakeHost {
    fn exec(&mut self, command_line: &str) -> Result<RawOutput> {
        Err(ProvisionError::channel(format!(
            "fake host only runs typed commands, got `{}`",
            command_line
        )))
    }

    fn run(&mut self, command: &RemoteCommand) -> Result<RawOutput> {
        if self.closed {
            return Err(ProvisionError::channel("fake session is closed"));
        }
        // Rendering must never panic, whatever the inputs
        let _ = command.render();
        self.state_mut().log.push(command.clone());

        match self.take_fault(command) {
            Some(FaultEffect::SignalBefore(signal)) => Ok(RawOutput {
                stdout: String::new(),
                stderr: String::new(),
                status: ExitStatus::Signal(signal),
            }),
            Some(FaultEffect::SignalAfter(signal)) => {
                let mut output = self.apply(command);
                output.status = ExitStatus::Signal(signal);
                Ok(output)
            }
            Some(FaultEffect::Exit(exit)) => Ok(fail(exit, "injected failure")),
            None => Ok(self.apply(command)),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.state_mut().closes += 1;
        Ok(())
    }
}

impl Transfer for FakeHost {
    fn transfer(&mut self, local: &Path, remote_path: &str) -> Result<()> {
        let mut bytes = std::fs::read(local)?;
        let mut state = self.state_mut();
        if state.corrupt_uploads {
            if let Some(first) = bytes.first_mut() {
                *first ^= 0xff;
            } else {
                bytes.push(0);
            }
        }
        state.files.insert(remote_path.to_string(), bytes);
        Ok(())
    }
}

pub const PACK_URL: &str =
    "https://github.com/buildpacks/pack/releases/download/v0.28.0/pack-v0.28.0-linux.tgz";

/// A served pack tarball and the artifact that trusts it
pub fn pack_fixture(host: &FakeHost) -> VerifiedArtifact {
    let binary = b"\x7fELF pack v0.28.0".to_vec();
    let archive = FakeArchive {
        bytes: b"gzip bytes of pack-v0.28.0-linux.tgz".to_vec(),
        entries: vec![("pack".to_string(), binary.clone())],
    };
    let artifact = VerifiedArtifact {
        name: "pack".to_string(),
        url: PACK_URL.to_string(),
        tarball_sha256: Sha256Digest::of_bytes(&archive.bytes),
        binary_sha256: Sha256Digest::of_bytes(&binary),
        binary_in_tarball: "pack".to_string(),
        install_path: "/usr/local/bin/pack".to_string(),
    };
    host.serve(PACK_URL, archive);
    artifact
}

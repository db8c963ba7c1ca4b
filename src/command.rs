//! Typed remote commands.
//!
//! Every operation the engine performs on the remote machine is a
//! `RemoteCommand` variant. `render()` is the single place where a request is
//! turned into a shell string, and every caller-supplied value passes through
//! `sh_quote` on the way.
//!
//! # Contract
//!
//! - `render()` returns exactly the command line the remote shell executes.
//! - `is_mutating()` is false only for commands that never change remote state;
//!   dry runs execute those and skip everything else.
//! - Paths are remote paths and are never resolved locally.

use crate::error::{ProvisionError, Result};
use crate::package::PackageName;
use std::fmt;
use strum::Display;

/// Address family for firewall rule persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum IpFamily {
    #[strum(serialize = "IPv4")]
    V4,
    #[strum(serialize = "IPv6")]
    V6,
}

/// A single request to the remote machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    /// `test -e <path>`
    PathExists { path: String },
    /// `cp -p <from> <to>`
    Copy { from: String, to: String },
    /// `mv -f <from> <to>`
    Move { from: String, to: String },
    /// `rm -f <path>`
    Remove { path: String },
    /// `rm -rf <path>`
    RemoveTree { path: String },
    /// `touch <path>`
    Touch { path: String },
    /// `mkdir -p <path>`
    MakeDir { path: String },
    /// `mktemp -d`
    MakeTempDir,
    /// `ls -1 <path>`
    ListDir { path: String },
    /// `cat <path>`
    ReadFile { path: String },
    /// `diff -y --suppress-common-lines <left> <right> || true`
    Diff { left: String, right: String },
    /// `sha256sum <path>`
    Sha256 { path: String },
    /// `chmod <mode> <path>`
    SetMode { path: String, mode: u32 },
    /// `uname -m`
    MachineArch,
    /// `dpkg-query -W -f='${Status}' <package>`
    PackageStatus { package: PackageName },
    /// `apt-get update`
    RefreshPackageIndex,
    /// `apt-get install -y --no-upgrade <package>`
    InstallPackage { package: PackageName },
    /// `printf '%s\n' <selection> | debconf-set-selections`
    DebconfSet { selection: String },
    /// `curl -fsSL --max-time <secs> -o <dest> <url>`
    Download {
        url: String,
        dest: String,
        timeout_secs: u64,
    },
    /// `tar -xzf <archive> -C <dir>`
    Untar { archive: String, dir: String },
    /// `sed -i` replacing every line containing `matching` with `line`
    ReplaceLine {
        path: String,
        matching: String,
        line: String,
    },
    /// `printf '%s' <rules> | iptables-restore`
    RestoreFirewall { rules: String },
    /// `iptables-save > <dest>` (or `ip6tables-save`)
    SaveFirewall { family: IpFamily, dest: String },
}

/// Placeholder stdout for `mktemp -d` when a dry run skips it.
pub const DRY_RUN_TEMP_DIR: &str = "/tmp/hostseed.dry-run";

impl RemoteCommand {
    /// Build a `ReplaceLine` after checking both sides are safe inside a
    /// single-line `sed` script delimited by `|`.
    pub fn replace_line(
        path: impl Into<String>,
        matching: impl Into<String>,
        line: impl Into<String>,
    ) -> Result<Self> {
        let matching = matching.into();
        let line = line.into();
        for (what, value) in [("pattern", &matching), ("replacement", &line)] {
            if value.is_empty() {
                return Err(ProvisionError::validation(format!("sed {} is empty", what)));
            }
            if value.contains('|') || value.contains('\n') {
                return Err(ProvisionError::validation(format!(
                    "sed {} '{}' contains '|' or a newline",
                    what, value
                )));
            }
        }
        Ok(Self::ReplaceLine {
            path: path.into(),
            matching,
            line,
        })
    }

    /// Render the shell command line for this request.
    pub fn render(&self) -> String {
        match self {
            Self::PathExists { path } => format!("test -e {}", sh_quote(path)),
            Self::Copy { from, to } => format!("cp -p {} {}", sh_quote(from), sh_quote(to)),
            Self::Move { from, to } => format!("mv -f {} {}", sh_quote(from), sh_quote(to)),
            Self::Remove { path } => format!("rm -f {}", sh_quote(path)),
            Self::RemoveTree { path } => format!("rm -rf {}", sh_quote(path)),
            Self::Touch { path } => format!("touch {}", sh_quote(path)),
            Self::MakeDir { path } => format!("mkdir -p {}", sh_quote(path)),
            Self::MakeTempDir => "mktemp -d".to_string(),
            Self::ListDir { path } => format!("ls -1 {}", sh_quote(path)),
            Self::ReadFile { path } => format!("cat {}", sh_quote(path)),
            Self::Diff { left, right } => format!(
                "diff -y --suppress-common-lines {} {} || true",
                sh_quote(left),
                sh_quote(right)
            ),
            Self::Sha256 { path } => format!("sha256sum {}", sh_quote(path)),
            Self::SetMode { path, mode } => format!("chmod {:o} {}", mode, sh_quote(path)),
            Self::MachineArch => "uname -m".to_string(),
            Self::PackageStatus { package } => format!(
                "dpkg-query -W -f='${{Status}}' {}",
                sh_quote(package.as_str())
            ),
            Self::RefreshPackageIndex => {
                "DEBIAN_FRONTEND=noninteractive apt-get update".to_string()
            }
            Self::InstallPackage { package } => format!(
                "DEBIAN_FRONTEND=noninteractive apt-get install -y --no-upgrade {}",
                sh_quote(package.as_str())
            ),
            Self::DebconfSet { selection } => format!(
                "printf '%s\\n' {} | debconf-set-selections",
                sh_quote(selection)
            ),
            Self::Download {
                url,
                dest,
                timeout_secs,
            } => format!(
                "curl -fsSL --max-time {} -o {} {}",
                timeout_secs,
                sh_quote(dest),
                sh_quote(url)
            ),
            Self::Untar { archive, dir } => {
                format!("tar -xzf {} -C {}", sh_quote(archive), sh_quote(dir))
            }
            Self::ReplaceLine {
                path,
                matching,
                line,
            } => {
                let script = format!(
                    "s|^.*{}.*$|{}|",
                    sed_escape_pattern(matching),
                    sed_escape_replacement(line)
                );
                format!("sed -i {} {}", sh_quote(&script), sh_quote(path))
            }
            Self::RestoreFirewall { rules } => {
                format!("printf '%s' {} | iptables-restore", sh_quote(rules))
            }
            Self::SaveFirewall { family, dest } => {
                let tool = match family {
                    IpFamily::V4 => "iptables-save",
                    IpFamily::V6 => "ip6tables-save",
                };
                format!("{} > {}", tool, sh_quote(dest))
            }
        }
    }

    /// Returns false for commands that only read remote state.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Self::PathExists { .. }
                | Self::ListDir { .. }
                | Self::ReadFile { .. }
                | Self::Diff { .. }
                | Self::Sha256 { .. }
                | Self::MachineArch
                | Self::PackageStatus { .. }
        )
    }

    /// Stdout reported for this command when a dry run skips it.
    pub fn dry_run_stdout(&self) -> &'static str {
        match self {
            Self::MakeTempDir => DRY_RUN_TEMP_DIR,
            _ => "",
        }
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Quote a value for POSIX sh using single quotes.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Escape basic-regex metacharacters so `pattern` matches literally.
fn sed_escape_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '\\' | '.' | '*' | '[' | ']' | '^' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape characters that are special in a sed replacement.
fn sed_escape_replacement(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    for c in line.chars() {
        if matches!(c, '\\' | '&') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(name: &str) -> PackageName {
        name.parse().expect("valid package name")
    }

    #[test]
    fn test_sh_quote_plain_and_embedded_quote() {
        assert_eq!(sh_quote("/etc/hosts"), "'/etc/hosts'");
        assert_eq!(sh_quote("it's"), "'it'\\''s'");
        assert_eq!(sh_quote(""), "''");
    }

    #[test]
    fn test_render_file_operations() {
        let cmd = RemoteCommand::Copy {
            from: "/etc/a".to_string(),
            to: "/etc/a.bak".to_string(),
        };
        assert_eq!(cmd.render(), "cp -p '/etc/a' '/etc/a.bak'");

        let cmd = RemoteCommand::PathExists {
            path: "/etc/a.bak.finished".to_string(),
        };
        assert_eq!(cmd.render(), "test -e '/etc/a.bak.finished'");

        let cmd = RemoteCommand::SetMode {
            path: "/usr/local/bin/pack".to_string(),
            mode: 0o755,
        };
        assert_eq!(cmd.render(), "chmod 755 '/usr/local/bin/pack'");
    }

    #[test]
    fn test_render_package_commands() {
        let status = RemoteCommand::PackageStatus { package: pkg("curl") };
        assert_eq!(status.render(), "dpkg-query -W -f='${Status}' 'curl'");

        let install = RemoteCommand::InstallPackage { package: pkg("curl") };
        assert_eq!(
            install.render(),
            "DEBIAN_FRONTEND=noninteractive apt-get install -y --no-upgrade 'curl'"
        );
    }

    #[test]
    fn test_render_download_bounds_transfer_time() {
        let cmd = RemoteCommand::Download {
            url: "https://example.com/pack.tgz".to_string(),
            dest: "/tmp/x/pack.tgz".to_string(),
            timeout_secs: 120,
        };
        assert_eq!(
            cmd.render(),
            "curl -fsSL --max-time 120 -o '/tmp/x/pack.tgz' 'https://example.com/pack.tgz'"
        );
    }

    #[test]
    fn test_replace_line_escapes_sed_metacharacters() {
        let cmd = RemoteCommand::replace_line(
            "/etc/conf",
            "Unattended-Upgrade::Verbose \"",
            "Unattended-Upgrade::Verbose \"true\"; // a & b",
        )
        .expect("valid edit");
        assert_eq!(
            cmd.render(),
            concat!(
                "sed -i 's|^.*Unattended-Upgrade::Verbose \".*$|",
                "Unattended-Upgrade::Verbose \"true\"; // a \\& b|' '/etc/conf'"
            )
        );

        let cmd = RemoteCommand::replace_line("/f", "a.b[1]", "x").expect("valid edit");
        assert!(cmd.render().contains("a\\.b\\[1\\]"));
    }

    #[test]
    fn test_replace_line_rejects_delimiter_and_newline() {
        assert!(RemoteCommand::replace_line("/f", "a|b", "c").is_err());
        assert!(RemoteCommand::replace_line("/f", "a", "c\nd").is_err());
        assert!(RemoteCommand::replace_line("/f", "", "c").is_err());
    }

    #[test]
    fn test_firewall_commands() {
        let restore = RemoteCommand::RestoreFirewall {
            rules: "*filter\nCOMMIT\n".to_string(),
        };
        assert_eq!(
            restore.render(),
            "printf '%s' '*filter\nCOMMIT\n' | iptables-restore"
        );

        let save = RemoteCommand::SaveFirewall {
            family: IpFamily::V6,
            dest: "/etc/iptables/rules.v6".to_string(),
        };
        assert_eq!(save.render(), "ip6tables-save > '/etc/iptables/rules.v6'");
    }

    #[test]
    fn test_mutation_classification() {
        assert!(!RemoteCommand::MachineArch.is_mutating());
        assert!(!RemoteCommand::PackageStatus { package: pkg("curl") }.is_mutating());
        assert!(RemoteCommand::InstallPackage { package: pkg("curl") }.is_mutating());
        assert!(RemoteCommand::Touch { path: "/x".to_string() }.is_mutating());
        assert!(RemoteCommand::MakeTempDir.is_mutating());
        assert_eq!(RemoteCommand::MakeTempDir.dry_run_stdout(), DRY_RUN_TEMP_DIR);
    }
}

//! hostseed library
//!
//! Idempotent provisioning of a remote machine over ssh. Every operation can
//! be re-run after a crash, a dropped connection or a failed step, and will
//! either skip finished work or finish it, never redo it halfway.

pub mod artifact;
pub mod cli;
pub mod command;
pub mod config;
pub mod digest;
pub mod error;
pub mod firewall;
pub mod guarded_file;
pub mod host;
pub mod orchestrator;
pub mod package;
pub mod plan;
pub mod process_guard;
pub mod runner;
pub mod session;
pub mod tarball;
pub mod transfer;
pub mod upgrades;

// Re-export main types for convenience
pub use artifact::{ArtifactOutcome, VerifiedArtifact, ensure_artifact_installed};
pub use command::{IpFamily, RemoteCommand, sh_quote};
pub use config::ProvisionConfig;
pub use digest::Sha256Digest;
pub use error::{ProvisionError, Result};
pub use guarded_file::{GuardOutcome, GuardedFile};
pub use orchestrator::{
    ConsoleReporter, Orchestrator, RecordingReporter, Reporter, RunContext, RunReport,
    StepFailure, StepState,
};
pub use package::{PackageName, PackageOutcome, ensure_installed};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use runner::{CommandResult, CommandRunner, Outcome, Probe};
pub use session::{ConnectOptions, ExitStatus, RawOutput, Session, SshSession, SshTarget};
pub use transfer::{ScpTransfer, Transfer};

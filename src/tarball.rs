//! Packing a source directory for upload.
//!
//! Tarballs are named `<dir>-<unix time>[-<git short sha>].tar.gz`. The sha
//! is only added when the directory is a clean git checkout, so a name with a
//! sha always identifies exactly the committed sources.

use crate::error::{ProvisionError, Result};
use crate::process_guard;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Directory names never packed
const SKIPPED_DIRS: &[&str] = &[".git"];

/// Tarball file name for `source_dir` at `unix_time`.
pub fn tarball_name(source_dir: &Path, unix_time: u64, short_sha: Option<&str>) -> Result<String> {
    let dir_name = source_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            ProvisionError::validation(format!("{:?} has no usable directory name", source_dir))
        })?;
    Ok(match short_sha {
        Some(sha) => format!("{}-{}-{}.tar.gz", dir_name, unix_time, sha),
        None => format!("{}-{}.tar.gz", dir_name, unix_time),
    })
}

/// Pack every regular file under `source_dir` into `out_dir/<name>`.
pub fn create_tarball(source_dir: &Path, out_dir: &Path, name: &str) -> Result<PathBuf> {
    let out_path = out_dir.join(name);
    tracing::info!("Creating tarball {:?} from {:?}", out_path, source_dir);

    let encoder = GzEncoder::new(File::create(&out_path)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let walker = walkdir::WalkDir::new(source_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .is_some_and(|n| SKIPPED_DIRS.contains(&n)))
        });

    let mut count = 0usize;
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        let path = entry.path();
        if !entry.file_type().is_file() || path == out_path {
            continue;
        }
        let Ok(relative) = path.strip_prefix(source_dir) else {
            continue;
        };
        builder.append_path_with_name(path, relative)?;
        count += 1;
    }

    builder.into_inner()?.finish()?;
    tracing::info!("Packed {} file(s)", count);
    Ok(out_path)
}

/// Short sha of HEAD when `dir` is a clean git checkout.
pub fn git_short_sha(dir: &Path) -> Option<String> {
    if !dir.join(".git").exists() {
        tracing::info!(".git directory does not exist, not adding a sha to the tarball name");
        return None;
    }

    let git = |args: &[&str]| {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir).args(args);
        process_guard::output_guarded(&mut cmd)
    };

    let diff = match git(&["status", "--porcelain"]) {
        Ok(output) if output.status.success() => output.stdout,
        Ok(output) => {
            tracing::info!(
                "git status failed, not adding a sha to the tarball name: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }
        Err(e) => {
            tracing::info!("git is not available ({}), not adding a sha to the tarball name", e);
            return None;
        }
    };
    if !diff.is_empty() {
        tracing::info!("Directory has uncommitted changes, not adding a sha to the tarball name");
        return None;
    }

    match git(&["rev-parse", "--short", "HEAD"]) {
        Ok(output) if output.status.success() => {
            let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
            (!sha.is_empty()).then_some(sha)
        }
        _ => None,
    }
}

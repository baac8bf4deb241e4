// src/staging.rs

//! Staging engine
//!
//! Transactionally materializes a set of verified package files into the
//! persistent active-packages directory. The batch either fully commits or
//! leaves the directory untouched: every destination written before a
//! failure is unlinked by a scope guard. After a successful commit,
//! previously active files superseded by the batch are removed; that
//! removal runs outside the guard, so a crash in between can leave several
//! versions of a name on disk, which the next activation scan resolves by
//! picking the highest version.

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, warn};

use crate::config::ApexdConfig;
use crate::error::{Error, Result};
use crate::package::{find_package_files, ApexFile, APEX_SUFFIX};
use crate::verity::VerityVerifier;

const ACTIVE_DIR_MODE: u32 = 0o750;

/// Open and verify every path (archive view, manifest, verity gate).
/// Fails fast on the first bad package.
pub fn verify_packages(verifier: &VerityVerifier, paths: &[PathBuf]) -> Result<Vec<ApexFile>> {
    if paths.is_empty() {
        return Err(Error::BadInput("empty set of inputs".to_string()));
    }
    debug!("verifying {} package(s)", paths.len());

    let mut packages = Vec::with_capacity(paths.len());
    for path in paths {
        let apex = ApexFile::open(path)?;
        verifier.verify(&apex)?;
        packages.push(apex);
    }
    Ok(packages)
}

/// Unlinks all recorded paths on drop unless committed.
struct StagedFilesGuard {
    staged: Vec<PathBuf>,
    committed: bool,
}

impl StagedFilesGuard {
    fn new() -> Self {
        Self {
            staged: Vec::new(),
            committed: false,
        }
    }

    fn push(&mut self, path: PathBuf) {
        self.staged.push(path);
    }

    fn commit(&mut self) -> HashSet<PathBuf> {
        self.committed = true;
        self.staged.drain(..).collect()
    }
}

impl Drop for StagedFilesGuard {
    fn drop(&mut self) {
        if !self.committed {
            for path in &self.staged {
                if let Err(e) = fs::remove_file(path) {
                    warn!("unable to unlink {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// Stage `paths` into the active-packages directory.
///
/// With `link` set the sources are hard-linked (the normal path for files
/// coming from a staged session on the same filesystem); otherwise they are
/// renamed out of their scratch directory and their security label is
/// restored at the destination.
pub fn stage_packages(
    config: &ApexdConfig,
    verifier: &VerityVerifier,
    paths: &[PathBuf],
    link: bool,
) -> Result<()> {
    let packages = verify_packages(verifier, paths)?;

    create_active_dir(&config.active_dir)?;

    let mut guard = StagedFilesGuard::new();
    let mut staged_names = HashSet::new();
    for apex in &packages {
        let dest = config
            .active_dir
            .join(format!("{}{}", apex.package_id(), APEX_SUFFIX));

        if link {
            fs::hard_link(apex.path(), &dest).map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "unable to link {} to {}: {}",
                        apex.path().display(),
                        dest.display(),
                        e
                    ),
                ))
            })?;
        } else {
            fs::rename(apex.path(), &dest).map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "unable to rename {} to {}: {}",
                        apex.path().display(),
                        dest.display(),
                        e
                    ),
                ))
            })?;
            restore_security_label(&dest);
        }

        guard.push(dest.clone());
        staged_names.insert(apex.manifest().name.clone());
        debug!(
            "staged {} to {}",
            apex.path().display(),
            dest.display()
        );
    }

    // Accept the state.
    let staged_files = guard.commit();

    remove_previously_active(config, &staged_names, &staged_files)
}

fn create_active_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    // mkdir honors the umask; set the mode explicitly.
    fs::set_permissions(dir, fs::Permissions::from_mode(ACTIVE_DIR_MODE))?;
    Ok(())
}

/// Restore the SELinux label of a freshly renamed destination. Labeling is
/// owned by the platform policy tooling; absence of the tool is tolerated.
fn restore_security_label(path: &Path) {
    match Command::new("restorecon").arg(path).status() {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("restorecon {} exited with {}", path.display(), status),
        Err(e) => warn!("could not run restorecon for {}: {}", path.display(), e),
    }
}

/// Remove files in the active directory that belong to one of the staged
/// package names but were not part of the committed set.
fn remove_previously_active(
    config: &ApexdConfig,
    staged_names: &HashSet<String>,
    files_to_keep: &HashSet<PathBuf>,
) -> Result<()> {
    let all_active = find_package_files(&config.active_dir, false)?;

    for path in all_active {
        let apex = ApexFile::open(&path)?;
        if !staged_names.contains(&apex.manifest().name) {
            // Belongs to a package outside this batch; keep it.
            continue;
        }
        if files_to_keep.contains(&path) {
            continue;
        }

        debug!("deleting previously active package {}", path.display());
        fs::remove_file(&path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to unlink {}: {}", path.display(), e),
            ))
        })?;
    }

    Ok(())
}

// src/controller.rs

//! Activation controller
//!
//! Top-level operations over single packages, directory sweeps, and staged
//! sessions. The controller owns the mounted-package registry and all its
//! collaborators (verity verifier, hook runner, status publisher); exactly
//! one controller mutates the system at a time.

use std::fs;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{umount2, MntFlags};
use tracing::{debug, error, info, warn};

use crate::config::ApexdConfig;
use crate::error::{Error, Result};
use crate::hooks::{self, HookRunner};
use crate::loopdev;
use crate::mount;
use crate::package::{find_package_files, ApexFile};
use crate::registry::MountedRegistry;
use crate::session::{SessionState, StagedSession};
use crate::staging;
use crate::status::{DaemonStatus, StatusPublisher};
use crate::verity::{SignatureReader, VerityVerifier};

/// Name and version of an active package, as reported to the IPC layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApexInfo {
    pub name: String,
    pub version: u64,
    pub path: PathBuf,
}

/// What an activation has to do, derived from the registry snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActivationPlan {
    /// The same version is already mounted and published as latest
    already_active: bool,
    /// The same version is already mounted (latest or not)
    already_mounted: bool,
    /// No mounted version is newer than the candidate
    is_newest: bool,
}

fn plan_activation(registry: &MountedRegistry, name: &str, new_version: u64) -> ActivationPlan {
    let mut plan = ActivationPlan {
        already_active: false,
        already_mounted: false,
        is_newest: true,
    };
    registry.for_each(name, |record, latest| {
        if record.version == new_version {
            plan.already_mounted = true;
            if latest {
                plan.already_active = true;
            }
        }
        if record.version > new_version {
            plan.is_newest = false;
        }
    });
    plan
}

/// The activation engine
pub struct Apexd {
    config: ApexdConfig,
    verifier: VerityVerifier,
    registry: MountedRegistry,
    hooks: Box<dyn HookRunner>,
    status: StatusPublisher,
}

impl Apexd {
    pub fn new(
        config: ApexdConfig,
        reader: Box<dyn SignatureReader>,
        hooks: Box<dyn HookRunner>,
    ) -> Self {
        let verifier = VerityVerifier::new(config.key_dirs.clone(), reader);
        let status = StatusPublisher::new(&config.status_file);
        Self {
            config,
            verifier,
            registry: MountedRegistry::new(),
            hooks,
            status,
        }
    }

    pub fn config(&self) -> &ApexdConfig {
        &self.config
    }

    pub fn registry(&self) -> &MountedRegistry {
        &self.registry
    }

    /// Mount the package at `path` and publish it as latest if it carries
    /// the highest mounted version of its name.
    pub fn activate(&mut self, path: &Path) -> Result<()> {
        info!("trying to activate {}", path.display());
        let apex = ApexFile::open(path)?;
        let manifest = apex.manifest().clone();

        let plan = plan_activation(&self.registry, &manifest.name, manifest.version);
        if plan.already_active {
            return Err(Error::AlreadyActive(format!(
                "package {} is already active",
                manifest.package_id()
            )));
        }

        let mount_point = self.config.apex_root.join(manifest.package_id());
        if !plan.already_mounted {
            mount::mount_package(
                &self.config,
                &self.verifier,
                &mut self.registry,
                &apex,
                &mount_point,
            )?;
        }

        if plan.is_newest {
            let alias = self.config.apex_root.join(&manifest.name);
            match mount::bind_mount_latest(&alias, &mount_point) {
                Ok(()) => self.registry.set_latest(&manifest.name, path)?,
                // The versioned mount stays usable; the previous latest
                // keeps serving the alias until a later flip succeeds.
                Err(e) => error!(
                    "failed to publish {} as latest: {}",
                    manifest.package_id(),
                    e
                ),
            }
        }

        Ok(())
    }

    /// Unmount the non-latest instance backed by `path` and drop its
    /// registry record.
    pub fn deactivate(&mut self, path: &Path) -> Result<()> {
        info!("trying to deactivate {}", path.display());
        let apex = ApexFile::open(path)?;
        mount::unmount_package(&mut self.registry, &apex)
    }

    /// The packages currently published as latest.
    pub fn get_active_packages(&self) -> Vec<ApexInfo> {
        let mut active = Vec::new();
        self.registry.for_each_all(|record, latest| {
            if latest {
                active.push(ApexInfo {
                    name: record.name.clone(),
                    version: record.version,
                    path: record.path.clone(),
                });
            }
        });
        active.sort_by(|a, b| a.name.cmp(&b.name));
        active
    }

    /// Activate every package file in `dir`. On the system partition,
    /// subdirectories are scanned as flattened packages. Per-entry errors
    /// are reported and do not abort the sweep.
    pub fn scan_and_activate(&mut self, dir: &Path) {
        info!("scanning {} looking for packages", dir.display());
        let include_dirs = dir.starts_with(&self.config.system_dir);
        let found = match find_package_files(dir, include_dirs) {
            Ok(found) => found,
            Err(e) => {
                warn!("failed to scan {}: {}", dir.display(), e);
                return;
            }
        };

        for path in found {
            info!("found {}", path.display());
            if let Err(e) = self.activate(&path) {
                error!("failed to activate {}: {}", path.display(), e);
            }
        }
    }

    /// Startup recovery sweep: lazily unmount everything under the mount
    /// root and destroy orphan loop devices, so the daemon is restartable
    /// after an unclean exit. Per-entry errors are reported and skipped.
    pub fn unmount_and_detach_existing(&mut self) {
        info!(
            "scanning {} looking for packages already mounted",
            self.config.apex_root.display()
        );
        let entries = match fs::read_dir(&self.config.apex_root) {
            Ok(entries) => entries,
            Err(e) => {
                error!(
                    "failed to read {}: {}",
                    self.config.apex_root.display(),
                    e
                );
                return;
            }
        };

        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        // Ascending order puts the `<name>` alias before any
        // `<name>@<version>`, so the bind mount is detached first.
        dirs.sort();

        for dir in dirs {
            info!("unmounting {}", dir.display());
            match umount2(&dir, MntFlags::MNT_DETACH | MntFlags::UMOUNT_NOFOLLOW) {
                Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => {}
                Err(e) => error!("failed to unmount {}: {}", dir.display(), e),
            }
            if let Err(e) = fs::remove_dir(&dir) {
                error!("failed to remove {}: {}", dir.display(), e);
            }
        }

        if let Err(e) = loopdev::destroy_orphans() {
            warn!("failed to destroy orphan loop devices: {}", e);
        }
    }

    /// Verify and stage a batch of package files; all-or-nothing.
    pub fn stage_packages(&self, paths: &[PathBuf], link: bool) -> Result<()> {
        debug!("staging {} package(s)", paths.len());
        staging::stage_packages(&self.config, &self.verifier, paths, link)
    }

    /// Run the verification gate (archive, manifest, verity) over `paths`
    /// without staging or mounting anything.
    pub fn verify_packages(&self, paths: &[PathBuf]) -> Result<Vec<ApexFile>> {
        staging::verify_packages(&self.verifier, paths)
    }

    /// Verify the payload of a submitted session (or its children), run
    /// pre-install hooks over the verified set, and persist the session as
    /// `Verified`. Returns the verified packages.
    pub fn submit_staged_session(
        &self,
        session_id: u32,
        child_session_ids: &[u32],
    ) -> Result<Vec<ApexFile>> {
        let ids_to_scan: Vec<u32> = if child_session_ids.is_empty() {
            vec![session_id]
        } else {
            child_session_ids.to_vec()
        };

        let mut packages = Vec::with_capacity(ids_to_scan.len());
        for id in ids_to_scan {
            packages.push(self.verify_session_dir(id)?);
        }

        hooks::run_pre_install(self.hooks.as_ref(), &packages)?;

        let mut session = StagedSession::create(&self.config.sessions_dir, session_id)?;
        session.set_child_ids(child_session_ids);
        session.update_state_and_commit(SessionState::Verified)?;

        Ok(packages)
    }

    /// Flip a `Verified` session to `Staged` so the next boot scan picks
    /// it up. On a session already `Staged` this is a no-op.
    pub fn mark_staged_session_ready(&self, session_id: u32) -> Result<()> {
        let mut session = StagedSession::get(&self.config.sessions_dir, session_id)?;
        match session.state() {
            SessionState::Staged => Ok(()),
            SessionState::Verified => session.update_state_and_commit(SessionState::Staged),
            state => Err(Error::Session(format!(
                "session {} is in state {:?} and cannot be marked ready",
                session_id, state
            ))),
        }
    }

    /// Process every `Staged` session: stage its packages into the active
    /// directory and run post-install hooks. A failing session is marked
    /// `ActivationFailed` and does not abort the scan.
    pub fn scan_staged_sessions(&mut self) {
        info!(
            "scanning {} looking for sessions to be activated",
            self.config.sessions_dir.display()
        );
        let staged =
            StagedSession::sessions_in_state(&self.config.sessions_dir, SessionState::Staged);
        for mut session in staged {
            let id = session.id();
            match self.activate_session(&session) {
                Ok(()) => {
                    if let Err(e) = session.update_state_and_commit(SessionState::Activated) {
                        warn!("failed to persist session {} as activated: {}", id, e);
                    }
                }
                Err(e) => {
                    error!("activation failed for session {}: {}", id, e);
                    warn!("marking session {} as failed", id);
                    if let Err(e) = session.update_state_and_commit(SessionState::ActivationFailed)
                    {
                        warn!("failed to persist session {} as failed: {}", id, e);
                    }
                }
            }
        }
    }

    fn activate_session(&self, session: &StagedSession) -> Result<()> {
        let ids: Vec<u32> = if session.child_ids().is_empty() {
            vec![session.id()]
        } else {
            session.child_ids().to_vec()
        };

        let mut paths = Vec::with_capacity(ids.len());
        for id in ids {
            paths.push(self.session_package_path(id)?);
        }

        // Hooks run over the verified views; staging re-verifies the same
        // files before the commit.
        let packages = staging::verify_packages(&self.verifier, &paths)?;
        staging::stage_packages(&self.config, &self.verifier, &paths, true)?;
        hooks::run_post_install(self.hooks.as_ref(), &packages)?;
        Ok(())
    }

    fn verify_session_dir(&self, session_id: u32) -> Result<ApexFile> {
        let path = self.session_package_path(session_id)?;
        let mut verified = staging::verify_packages(&self.verifier, &[path])?;
        Ok(verified.remove(0))
    }

    /// The single package file a session directory must hold.
    fn session_package_path(&self, session_id: u32) -> Result<PathBuf> {
        let dir = crate::session::session_dir(&self.config.sessions_dir, session_id);
        debug!("scanning {} for a session package", dir.display());
        let mut found = find_package_files(&dir, false)
            .map_err(|e| Error::Session(format!("failed to scan {}: {}", dir.display(), e)))?;
        match found.len() {
            0 => Err(Error::Session(format!(
                "no package found in session directory {}",
                dir.display()
            ))),
            1 => Ok(found.remove(0)),
            n => Err(Error::Session(format!(
                "{} packages found in session directory {}; expected exactly one",
                n,
                dir.display()
            ))),
        }
    }

    /// Boot sequence: publish `starting`, recover from any previous unclean
    /// exit, finish staged sessions, activate everything, publish `ready`.
    pub fn bootstrap(&mut self) {
        self.status.publish(DaemonStatus::Starting);

        self.unmount_and_detach_existing();
        self.scan_staged_sessions();

        let system_dir = self.config.system_dir.clone();
        let active_dir = self.config.active_dir.clone();
        self.scan_and_activate(&system_dir);
        self.scan_and_activate(&active_dir);

        self.status.publish(DaemonStatus::Ready);
    }
}

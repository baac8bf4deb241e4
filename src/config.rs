// src/config.rs

//! Daemon configuration
//!
//! All filesystem layout paths and the one behavioral flag are carried in an
//! explicit config struct that is handed to the controller at construction
//! time. Nothing in the crate reads ambient global state; test fixtures
//! substitute a TempDir-rooted config.

use std::env;
use std::path::PathBuf;

/// Environment property forcing dm-verity mapping even for packages that
/// live on the (already verity-protected) system partition.
pub const VERITY_ON_SYSTEM_ENV: &str = "APEXD_VERITY_ON_SYSTEM";

/// Filesystem layout and behavior of the activation engine
#[derive(Debug, Clone)]
pub struct ApexdConfig {
    /// Mount root; versioned mounts live at `<root>/<name>@<version>` and
    /// the latest alias at `<root>/<name>`
    pub apex_root: PathBuf,
    /// Read-only system partition package directory
    pub system_dir: PathBuf,
    /// Persistent active-packages directory (created mode 0750)
    pub active_dir: PathBuf,
    /// Staged-session directories (`session_<id>`)
    pub sessions_dir: PathBuf,
    /// Trusted public-key directories, searched in order
    pub key_dirs: Vec<PathBuf>,
    /// Status publication file (`starting` -> `ready`)
    pub status_file: PathBuf,
    /// Daemon lock file
    pub lock_file: PathBuf,
    /// Map system-partition packages through dm-verity as well
    pub force_verity_on_system: bool,
}

impl ApexdConfig {
    /// Production layout with verity-on-system disabled.
    pub fn new() -> Self {
        Self {
            apex_root: PathBuf::from("/apex"),
            system_dir: PathBuf::from("/system/apex"),
            active_dir: PathBuf::from("/data/apex/active"),
            sessions_dir: PathBuf::from("/data/apex/sessions"),
            key_dirs: vec![
                PathBuf::from("/system/etc/security/apex"),
                PathBuf::from("/product/etc/security/apex"),
            ],
            status_file: PathBuf::from("/run/apexd/apexd.status"),
            lock_file: PathBuf::from("/run/apexd/apexd.lock"),
            force_verity_on_system: false,
        }
    }

    /// Production layout, with the verity-on-system flag read from the
    /// `APEXD_VERITY_ON_SYSTEM` environment property.
    pub fn from_env() -> Self {
        let force = matches!(
            env::var(VERITY_ON_SYSTEM_ENV).as_deref(),
            Ok("1") | Ok("true")
        );
        Self {
            force_verity_on_system: force,
            ..Self::new()
        }
    }
}

impl Default for ApexdConfig {
    fn default() -> Self {
        Self::new()
    }
}

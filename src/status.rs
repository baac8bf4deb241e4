// src/status.rs

//! Daemon status publication
//!
//! Other boot components block on the daemon's readiness before touching
//! anything under the mount root. The status transitions `starting` ->
//! `ready` once all mandatory activations complete; it is published as a
//! small file written atomically so readers never see a partial value.
//! Publication failures are logged and never fail the operation that
//! triggered them.

use std::fs;
use std::path::PathBuf;

use tracing::{error, info};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Starting,
    Ready,
}

impl DaemonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "starting" => Some(Self::Starting),
            "ready" => Some(Self::Ready),
            _ => None,
        }
    }
}

/// Writes the daemon status file
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    path: PathBuf,
}

impl StatusPublisher {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Publish `status`, logging (not propagating) failures.
    pub fn publish(&self, status: DaemonStatus) {
        info!("marking daemon as {}", status.as_str());
        if let Err(e) = self.try_publish(status) {
            error!(
                "failed to publish status '{}' to {}: {}",
                status.as_str(),
                self.path.display(),
                e
            );
        }
    }

    fn try_publish(&self, status: DaemonStatus) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, status.as_str())?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Current published status, if any.
    pub fn read(&self) -> Option<DaemonStatus> {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| DaemonStatus::parse(&s))
    }
}

// src/session.rs

//! Staged-session bookkeeping
//!
//! A staged session is a directory `session_<id>` under the sessions dir
//! holding exactly one package file plus a small JSON state record. The
//! record survives reboots so the boot-time scan can finish multi-step
//! upgrades: sessions are submitted as `Verified`, marked `Staged` when the
//! installer commits, and flipped to `Activated` or `ActivationFailed` by
//! the scan.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

const STATE_FILE: &str = "state.json";
const SESSION_DIR_PREFIX: &str = "session_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Packages verified and pre-install hooks run
    Verified,
    /// Installer committed; activate at next boot scan
    Staged,
    /// Successfully staged into the active directory
    Activated,
    /// Activation was attempted and failed
    ActivationFailed,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    id: u32,
    state: SessionState,
    #[serde(default)]
    child_ids: Vec<u32>,
}

/// A staged session with its persisted state
#[derive(Debug)]
pub struct StagedSession {
    record: SessionRecord,
    dir: PathBuf,
}

impl StagedSession {
    /// Create the session directory (if needed) and return a new session
    /// in `Verified` state. The state is not persisted until
    /// [`StagedSession::commit`] or [`StagedSession::update_state_and_commit`].
    pub fn create(sessions_dir: &Path, id: u32) -> Result<Self> {
        let dir = session_dir(sessions_dir, id);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::Session(format!("failed to create {}: {}", dir.display(), e)))?;
        Ok(Self {
            record: SessionRecord {
                id,
                state: SessionState::Verified,
                child_ids: Vec::new(),
            },
            dir,
        })
    }

    /// Load the persisted session `id`.
    pub fn get(sessions_dir: &Path, id: u32) -> Result<Self> {
        let dir = session_dir(sessions_dir, id);
        let state_path = dir.join(STATE_FILE);
        let raw = fs::read_to_string(&state_path)
            .map_err(|e| Error::Session(format!("failed to open {}: {}", state_path.display(), e)))?;
        let record: SessionRecord = serde_json::from_str(&raw)
            .map_err(|e| Error::Session(format!("failed to parse {}: {}", state_path.display(), e)))?;
        Ok(Self { record, dir })
    }

    /// All sessions with a readable state record. Unparseable entries are
    /// logged and skipped.
    pub fn list(sessions_dir: &Path) -> Vec<Self> {
        let mut sessions = Vec::new();
        let entries = match fs::read_dir(sessions_dir) {
            Ok(entries) => entries,
            Err(_) => return sessions,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name
                .strip_prefix(SESSION_DIR_PREFIX)
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            match Self::get(sessions_dir, id) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("skipping session {}: {}", id, e),
            }
        }
        sessions.sort_by_key(|s| s.record.id);
        sessions
    }

    /// All sessions currently in `state`.
    pub fn sessions_in_state(sessions_dir: &Path, state: SessionState) -> Vec<Self> {
        Self::list(sessions_dir)
            .into_iter()
            .filter(|s| s.record.state == state)
            .collect()
    }

    pub fn id(&self) -> u32 {
        self.record.id
    }

    pub fn state(&self) -> SessionState {
        self.record.state
    }

    pub fn child_ids(&self) -> &[u32] {
        &self.record.child_ids
    }

    pub fn set_child_ids(&mut self, child_ids: &[u32]) {
        self.record.child_ids = child_ids.to_vec();
    }

    /// Directory holding this session's package payload.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Set the state and persist the record.
    pub fn update_state_and_commit(&mut self, state: SessionState) -> Result<()> {
        self.record.state = state;
        self.commit()
    }

    /// Persist the record; write-then-rename so readers never observe a
    /// partial state file.
    pub fn commit(&self) -> Result<()> {
        let state_path = self.dir.join(STATE_FILE);
        let tmp_path = self.dir.join(format!("{}.tmp", STATE_FILE));
        let raw = serde_json::to_string_pretty(&self.record)
            .map_err(|e| Error::Session(format!("failed to serialize session state: {}", e)))?;
        fs::write(&tmp_path, raw)
            .map_err(|e| Error::Session(format!("failed to write {}: {}", tmp_path.display(), e)))?;
        fs::rename(&tmp_path, &state_path).map_err(|e| {
            Error::Session(format!("failed to commit {}: {}", state_path.display(), e))
        })?;
        Ok(())
    }
}

/// Payload directory for session `id`.
pub fn session_dir(sessions_dir: &Path, id: u32) -> PathBuf {
    sessions_dir.join(format!("{}{}", SESSION_DIR_PREFIX, id))
}

// src/registry.rs

//! In-memory registry of mounted packages
//!
//! Maps each package name to the set of its currently mounted instances and
//! marks which instance is published as "latest". The registry insert is
//! the linearization point of activation: observers only ever see fully
//! committed mounts.
//!
//! Two invariants are enforced on insertion rather than trusted to callers:
//! at most one record per name is latest, and no two records share
//! `(name, version)`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// One mounted package instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedPackage {
    pub name: String,
    pub version: u64,
    /// Package file (or flattened directory) the mount came from
    pub path: PathBuf,
    /// Loop device node path; empty for flattened packages
    pub loop_device: String,
    /// Device-mapper node name; empty when verity mapping was skipped
    pub dm_device: String,
    /// The versioned mount point, `<root>/<name>@<version>`
    pub mount_point: PathBuf,
}

#[derive(Debug, Clone)]
struct Entry {
    data: MountedPackage,
    latest: bool,
}

/// Registry of all mounted package instances
#[derive(Debug, Default)]
pub struct MountedRegistry {
    packages: HashMap<String, Vec<Entry>>,
}

impl MountedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record. Rejects a duplicate `(name, version)` and a second
    /// latest record for the same name.
    pub fn add(&mut self, data: MountedPackage, latest: bool) -> Result<()> {
        let entries = self.packages.entry(data.name.clone()).or_default();

        if entries.iter().any(|e| e.data.version == data.version) {
            return Err(Error::AlreadyActive(format!(
                "{}@{} is already mounted",
                data.name, data.version
            )));
        }
        if latest && entries.iter().any(|e| e.latest) {
            return Err(Error::AlreadyActive(format!(
                "{} already has a latest version",
                data.name
            )));
        }

        entries.push(Entry { data, latest });
        Ok(())
    }

    /// Remove the record for `(name, path)`, returning it if present.
    pub fn remove(&mut self, name: &str, path: &Path) -> Option<MountedPackage> {
        let entries = self.packages.get_mut(name)?;
        let index = entries.iter().position(|e| e.data.path == path)?;
        let entry = entries.remove(index);
        if entries.is_empty() {
            self.packages.remove(name);
        }
        Some(entry.data)
    }

    /// Mark the record for `(name, path)` as latest, clearing the flag on
    /// every other record of the name.
    pub fn set_latest(&mut self, name: &str, path: &Path) -> Result<()> {
        let entries = self
            .packages
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("no mounted instance of {}", name)))?;
        if !entries.iter().any(|e| e.data.path == path) {
            return Err(Error::NotFound(format!(
                "no mounted instance of {} from {}",
                name,
                path.display()
            )));
        }
        for entry in entries.iter_mut() {
            entry.latest = entry.data.path == path;
        }
        Ok(())
    }

    /// Look up the record for `(name, path)`; returns the record and its
    /// latest flag.
    pub fn find(&self, name: &str, path: &Path) -> Option<(MountedPackage, bool)> {
        self.packages.get(name)?.iter().find_map(|e| {
            (e.data.path == path).then(|| (e.data.clone(), e.latest))
        })
    }

    /// Visit every record for `name`. Ordering is not guaranteed.
    pub fn for_each<F>(&self, name: &str, mut visitor: F)
    where
        F: FnMut(&MountedPackage, bool),
    {
        if let Some(entries) = self.packages.get(name) {
            for entry in entries {
                visitor(&entry.data, entry.latest);
            }
        }
    }

    /// Visit every record. Ordering is not guaranteed.
    pub fn for_each_all<F>(&self, mut visitor: F)
    where
        F: FnMut(&MountedPackage, bool),
    {
        for entries in self.packages.values() {
            for entry in entries {
                visitor(&entry.data, entry.latest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.packages.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

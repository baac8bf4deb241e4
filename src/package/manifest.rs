// src/package/manifest.rs

//! Package manifest parsing
//!
//! The manifest is the package's identity document: a dotted name that is
//! unique across the system, an unsigned integer version, and optional
//! pre/post-install hook paths interpreted relative to the mounted image.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Parsed `manifest.json` contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApexManifest {
    /// Dotted package identifier, e.g. `com.example.runtime`
    pub name: String,
    /// Monotonically comparable package version
    pub version: u64,
    /// Optional pre-install hook path, relative to the mounted image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_install_hook: Option<String>,
    /// Optional post-install hook path, relative to the mounted image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_install_hook: Option<String>,
}

impl ApexManifest {
    /// Parse and validate manifest bytes.
    ///
    /// Rejects an empty name, a missing version, and a non-integer version.
    pub fn parse(content: &str) -> Result<Self> {
        let manifest: ApexManifest = serde_json::from_str(content)
            .map_err(|e| Error::BadManifest(format!("failed to parse manifest JSON: {}", e)))?;

        if manifest.name.is_empty() {
            return Err(Error::BadManifest(
                "manifest field \"name\" must not be empty".to_string(),
            ));
        }

        Ok(manifest)
    }

    /// The derived package id, `<name>@<version>`.
    ///
    /// Used as the versioned mount path component and as the dm node name.
    pub fn package_id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

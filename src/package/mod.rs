// src/package/mod.rs

//! Package files
//!
//! A package is a read-only archive whose payload is an ext4 filesystem
//! image, accompanied by a small JSON manifest. The archive is never
//! decompressed here: the image entry must be stored uncompressed so it can
//! be handed to a loop device as an absolute byte range of the archive file.
//!
//! A package may also be "flattened": a plain directory under the read-only
//! system partition, carrying the same `manifest.json`. Flattened packages
//! are bind-mounted directly and have no image, loop device, or verity
//! mapping.

mod manifest;

pub use manifest::ApexManifest;

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::{Error, Result};

/// Package file suffix
pub const APEX_SUFFIX: &str = ".apex";

const IMAGE_ENTRY: &str = "image.img";
const MANIFEST_ENTRY: &str = "manifest.json";

/// How the package payload is delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageKind {
    /// Archive with an embedded filesystem image at an absolute byte range
    Archive { image_offset: u64, image_size: u64 },
    /// Directory on the system partition, bind-mounted as-is
    Flattened,
}

/// An opened, introspected package
///
/// Immutable after construction. Opening resolves the payload byte range
/// and extracts the manifest; it performs no cryptographic checks (those
/// are recomputed per mount by the verity layer).
#[derive(Debug, Clone)]
pub struct ApexFile {
    path: PathBuf,
    kind: PackageKind,
    manifest_raw: String,
    manifest: ApexManifest,
}

impl ApexFile {
    /// Open a package at `path`, which may be an archive file or a
    /// flattened package directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let meta = fs::metadata(path).map_err(|e| Error::OpenFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        if meta.is_dir() {
            Self::open_flattened(path)
        } else {
            Self::open_archive(path)
        }
    }

    fn open_archive(path: &Path) -> Result<Self> {
        let open_failed = |reason: String| Error::OpenFailed {
            path: path.to_path_buf(),
            reason,
        };

        let file = fs::File::open(path).map_err(|e| open_failed(e.to_string()))?;
        let mut archive = ZipArchive::new(file).map_err(|e| open_failed(e.to_string()))?;

        let (image_offset, image_size) = {
            let entry = archive
                .by_name(IMAGE_ENTRY)
                .map_err(|e| Self::entry_error(path, IMAGE_ENTRY, e))?;
            if entry.compression() != zip::CompressionMethod::Stored {
                return Err(open_failed(format!(
                    "entry '{}' must be stored uncompressed",
                    IMAGE_ENTRY
                )));
            }
            (entry.data_start(), entry.size())
        };

        let manifest_raw = {
            let mut entry = archive
                .by_name(MANIFEST_ENTRY)
                .map_err(|e| Self::entry_error(path, MANIFEST_ENTRY, e))?;
            let mut raw = String::new();
            entry
                .read_to_string(&mut raw)
                .map_err(|e| open_failed(format!("failed to extract manifest: {}", e)))?;
            raw
        };

        let manifest = ApexManifest::parse(&manifest_raw)?;

        Ok(Self {
            path: path.to_path_buf(),
            kind: PackageKind::Archive {
                image_offset,
                image_size,
            },
            manifest_raw,
            manifest,
        })
    }

    fn open_flattened(path: &Path) -> Result<Self> {
        let manifest_path = path.join(MANIFEST_ENTRY);
        let manifest_raw = match fs::read_to_string(&manifest_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MissingEntry {
                    path: path.to_path_buf(),
                    entry: MANIFEST_ENTRY.to_string(),
                })
            }
            Err(e) => {
                return Err(Error::OpenFailed {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        };
        let manifest = ApexManifest::parse(&manifest_raw)?;

        Ok(Self {
            path: path.to_path_buf(),
            kind: PackageKind::Flattened,
            manifest_raw,
            manifest,
        })
    }

    fn entry_error(path: &Path, entry: &str, err: ZipError) -> Error {
        match err {
            ZipError::FileNotFound => Error::MissingEntry {
                path: path.to_path_buf(),
                entry: entry.to_string(),
            },
            other => Error::OpenFailed {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        }
    }

    /// Path the package was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &ApexManifest {
        &self.manifest
    }

    /// The raw manifest bytes as embedded in the package.
    pub fn manifest_raw(&self) -> &str {
        &self.manifest_raw
    }

    pub fn package_id(&self) -> String {
        self.manifest.package_id()
    }

    pub fn is_flattened(&self) -> bool {
        self.kind == PackageKind::Flattened
    }

    /// Absolute byte range `(offset, size)` of the filesystem image within
    /// the archive file. `None` for flattened packages.
    pub fn image_range(&self) -> Option<(u64, u64)> {
        match self.kind {
            PackageKind::Archive {
                image_offset,
                image_size,
            } => Some((image_offset, image_size)),
            PackageKind::Flattened => None,
        }
    }
}

/// Enumerate package files in `dir`: regular files with the package suffix
/// and, when `include_dirs` is set, subdirectories (flattened packages).
///
/// Results are sorted for deterministic scan order.
pub fn find_package_files(dir: &Path, include_dirs: bool) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_file() {
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(APEX_SUFFIX))
            {
                found.push(path);
            }
        } else if file_type.is_dir() && include_dirs {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn write_archive(path: &Path, manifest: &str, image: &[u8]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = ZipWriter::new(file);
        let stored = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
        writer.start_file(MANIFEST_ENTRY, stored).unwrap();
        writer.write_all(manifest.as_bytes()).unwrap();
        writer.start_file(IMAGE_ENTRY, stored).unwrap();
        writer.write_all(image).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_open_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.apex");
        let manifest = r#"{"name":"com.example.apex","version":1}"#;
        let image = vec![0xA5u8; 8192];
        write_archive(&path, manifest, &image);

        let apex = ApexFile::open(&path).unwrap();
        assert_eq!(apex.manifest().name, "com.example.apex");
        assert_eq!(apex.manifest().version, 1);
        assert_eq!(apex.manifest_raw(), manifest);
        assert_eq!(apex.package_id(), "com.example.apex@1");
        assert!(!apex.is_flattened());

        // The recorded byte range must address exactly the stored image.
        let (offset, size) = apex.image_range().unwrap();
        assert_eq!(size, image.len() as u64);
        let archive_bytes = fs::read(&path).unwrap();
        let start = offset as usize;
        assert_eq!(&archive_bytes[start..start + image.len()], &image[..]);
    }

    #[test]
    fn test_open_missing_file() {
        let err = ApexFile::open("/nonexistent/missing.apex").unwrap_err();
        assert!(matches!(err, Error::OpenFailed { .. }));
    }

    #[test]
    fn test_open_missing_image_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("noimage.apex");
        let file = fs::File::create(&path).unwrap();
        let mut writer = ZipWriter::new(file);
        let stored = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
        writer.start_file(MANIFEST_ENTRY, stored).unwrap();
        writer
            .write_all(br#"{"name":"com.example.apex","version":1}"#)
            .unwrap();
        writer.finish().unwrap();

        let err = ApexFile::open(&path).unwrap_err();
        match err {
            Error::MissingEntry { entry, .. } => assert_eq!(entry, IMAGE_ENTRY),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_open_flattened() {
        let dir = TempDir::new().unwrap();
        let pkg = dir.path().join("com.example.flat");
        fs::create_dir(&pkg).unwrap();
        fs::write(
            pkg.join(MANIFEST_ENTRY),
            r#"{"name":"com.example.flat","version":3}"#,
        )
        .unwrap();

        let apex = ApexFile::open(&pkg).unwrap();
        assert!(apex.is_flattened());
        assert!(apex.image_range().is_none());
        assert_eq!(apex.package_id(), "com.example.flat@3");
    }

    #[test]
    fn test_open_flattened_without_manifest() {
        let dir = TempDir::new().unwrap();
        let pkg = dir.path().join("com.example.flat");
        fs::create_dir(&pkg).unwrap();

        let err = ApexFile::open(&pkg).unwrap_err();
        assert!(matches!(err, Error::MissingEntry { .. }));
    }

    #[test]
    fn test_find_package_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.apex"), b"x").unwrap();
        fs::write(dir.path().join("a.apex"), b"x").unwrap();
        fs::write(dir.path().join("ignored.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("com.example.flat")).unwrap();

        let files = find_package_files(dir.path(), false).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.apex", "b.apex"]);

        let with_dirs = find_package_files(dir.path(), true).unwrap();
        assert_eq!(with_dirs.len(), 3);
    }
}

// src/verity/mod.rs

//! Verity data extraction and trust validation
//!
//! This is the single cryptographic gate of the activation path. Every
//! mount recomputes the package's verity data from its signature block and
//! requires the embedded public key to be bit-identical to a key file named
//! `<package-name>.avbpubkey` in one of the trusted key directories.
//! Nothing downstream of this gate may read image bytes without verity
//! enforcement; verity data is never cached across activations.

mod avb;

use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::package::ApexFile;

/// Trusted key file suffix
pub const PUBKEY_SUFFIX: &str = ".avbpubkey";

/// Decoded hashtree descriptor, in the units the device-mapper target wants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashtreeDescriptor {
    pub dm_verity_version: u32,
    /// Size of the verity-protected data area in bytes
    pub image_size: u64,
    /// Byte offset of the hash tree within the image
    pub tree_offset: u64,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    /// Algorithm name as the kernel expects it, e.g. `sha256`
    pub hash_algorithm: String,
    pub root_digest: Vec<u8>,
    pub salt: Vec<u8>,
}

/// Hashtree descriptor plus the public key the package was signed with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityData {
    pub descriptor: HashtreeDescriptor,
    pub public_key: Vec<u8>,
}

/// Extraction of the signed descriptor and key from a package.
///
/// The verified-boot metadata format belongs to a platform collaborator;
/// this trait is its seam. Tests substitute stub readers.
pub trait SignatureReader: Send + Sync {
    fn read_signature(&self, apex: &ApexFile) -> Result<VerityData>;
}

/// Production reader: walks the verified-boot footer and vbmeta structures
/// embedded at the end of the payload image.
#[derive(Debug, Default)]
pub struct AvbSignatureReader;

impl SignatureReader for AvbSignatureReader {
    fn read_signature(&self, apex: &ApexFile) -> Result<VerityData> {
        let (image_offset, image_size) = apex.image_range().ok_or_else(|| {
            Error::VerityBadSignature(format!(
                "flattened package {} carries no signature block",
                apex.package_id()
            ))
        })?;
        let mut file = fs::File::open(apex.path())?;
        avb::read_signed_data(&mut file, image_offset, image_size)
    }
}

/// The trust gate: signature extraction plus trusted-key matching.
pub struct VerityVerifier {
    key_dirs: Vec<PathBuf>,
    reader: Box<dyn SignatureReader>,
}

impl VerityVerifier {
    pub fn new(key_dirs: Vec<PathBuf>, reader: Box<dyn SignatureReader>) -> Self {
        Self { key_dirs, reader }
    }

    /// Extract the package's verity data and require its embedded public
    /// key to match a trusted key file for the package name.
    pub fn verify(&self, apex: &ApexFile) -> Result<VerityData> {
        let data = self.reader.read_signature(apex)?;

        let name = &apex.manifest().name;
        let key_file = format!("{}{}", name, PUBKEY_SUFFIX);
        let mut key_seen = false;
        for dir in &self.key_dirs {
            let candidate = dir.join(&key_file);
            match fs::read(&candidate) {
                Ok(trusted) => {
                    key_seen = true;
                    if trusted == data.public_key {
                        return Ok(data);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if key_seen {
            Err(Error::VerityKeyMismatch(name.clone()))
        } else {
            Err(Error::VerityNoKey(name.clone()))
        }
    }
}

// src/verity/avb.rs

//! Signature block parsing
//!
//! The payload image embeds a verified-boot metadata blob: a footer at the
//! end of the image points at a vbmeta image whose auxiliary block carries
//! the hashtree descriptor and the public key the package was signed with.
//! This module walks those structures, checks the vbmeta digest, and pulls
//! out the fields the mount path needs. All multi-byte fields are
//! big-endian.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};

use super::{HashtreeDescriptor, VerityData};

const FOOTER_SIZE: u64 = 64;
const FOOTER_MAGIC: &[u8; 4] = b"AVBf";
const VBMETA_HEADER_SIZE: usize = 256;
const VBMETA_MAGIC: &[u8; 4] = b"AVB0";
// Upper bound on a plausible vbmeta blob; anything larger is rejected
// before allocation.
const VBMETA_MAX_SIZE: u64 = 1024 * 1024;

const HASHTREE_DESCRIPTOR_TAG: u64 = 1;
// Fixed-size portion of the hashtree descriptor payload, before the
// variable-length partition name, salt, and root digest.
const HASHTREE_FIXED_SIZE: usize = 164;

fn bad(msg: impl Into<String>) -> Error {
    Error::VerityBadSignature(msg.into())
}

fn slice<'a>(buf: &'a [u8], offset: usize, len: usize) -> Result<&'a [u8]> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or_else(|| bad("truncated structure"))
}

fn be_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let bytes = slice(buf, offset, 4)?;
    Ok(u32::from_be_bytes(bytes.try_into().expect("length checked")))
}

fn be_u64(buf: &[u8], offset: usize) -> Result<u64> {
    let bytes = slice(buf, offset, 8)?;
    Ok(u64::from_be_bytes(bytes.try_into().expect("length checked")))
}

/// Read the signed hashtree descriptor and embedded public key from the
/// image occupying `[image_offset, image_offset + image_size)` of `file`.
pub(super) fn read_signed_data(
    file: &mut File,
    image_offset: u64,
    image_size: u64,
) -> Result<VerityData> {
    if image_size < FOOTER_SIZE {
        return Err(bad("image too small to carry a signature footer"));
    }

    // Footer: magic, version, original image size, vbmeta offset + size.
    let mut footer = [0u8; FOOTER_SIZE as usize];
    file.seek(SeekFrom::Start(image_offset + image_size - FOOTER_SIZE))?;
    file.read_exact(&mut footer)?;
    if &footer[0..4] != FOOTER_MAGIC {
        return Err(bad("signature footer magic not found"));
    }
    let vbmeta_offset = be_u64(&footer, 20)?;
    let vbmeta_size = be_u64(&footer, 28)?;
    if vbmeta_size < VBMETA_HEADER_SIZE as u64 || vbmeta_size > VBMETA_MAX_SIZE {
        return Err(bad(format!("implausible vbmeta size {}", vbmeta_size)));
    }
    if vbmeta_offset.checked_add(vbmeta_size).is_none()
        || vbmeta_offset + vbmeta_size > image_size
    {
        return Err(bad("vbmeta extends past the image"));
    }

    let mut vbmeta = vec![0u8; vbmeta_size as usize];
    file.seek(SeekFrom::Start(image_offset + vbmeta_offset))?;
    file.read_exact(&mut vbmeta)?;

    parse_vbmeta(&vbmeta)
}

fn parse_vbmeta(vbmeta: &[u8]) -> Result<VerityData> {
    if &vbmeta[0..4] != VBMETA_MAGIC {
        return Err(bad("vbmeta magic not found"));
    }

    let auth_block_size = be_u64(vbmeta, 12)? as usize;
    let aux_block_size = be_u64(vbmeta, 20)? as usize;
    let algorithm_type = be_u32(vbmeta, 28)?;
    let hash_offset = be_u64(vbmeta, 32)? as usize;
    let hash_size = be_u64(vbmeta, 40)? as usize;
    let public_key_offset = be_u64(vbmeta, 64)? as usize;
    let public_key_size = be_u64(vbmeta, 72)? as usize;
    let descriptors_offset = be_u64(vbmeta, 96)? as usize;
    let descriptors_size = be_u64(vbmeta, 104)? as usize;

    let total = VBMETA_HEADER_SIZE
        .checked_add(auth_block_size)
        .and_then(|n| n.checked_add(aux_block_size))
        .ok_or_else(|| bad("vbmeta block sizes overflow"))?;
    if total > vbmeta.len() {
        return Err(bad("vbmeta block sizes exceed the blob"));
    }

    let auth_block = &vbmeta[VBMETA_HEADER_SIZE..VBMETA_HEADER_SIZE + auth_block_size];
    let aux_start = VBMETA_HEADER_SIZE + auth_block_size;
    let aux_block = &vbmeta[aux_start..aux_start + aux_block_size];

    // The stored digest covers the header and the auxiliary block. The
    // asymmetric signature over that digest is checked by the platform
    // verified-boot collaborator; what matters to activation is that the
    // embedded key is bit-identical to a trusted one, which the caller
    // enforces.
    let stored_hash = slice(auth_block, hash_offset, hash_size)?;
    let computed: Vec<u8> = match algorithm_type {
        1..=3 => {
            let mut hasher = Sha256::new();
            hasher.update(&vbmeta[..VBMETA_HEADER_SIZE]);
            hasher.update(aux_block);
            hasher.finalize().to_vec()
        }
        4..=6 => {
            let mut hasher = Sha512::new();
            hasher.update(&vbmeta[..VBMETA_HEADER_SIZE]);
            hasher.update(aux_block);
            hasher.finalize().to_vec()
        }
        0 => return Err(bad("package is unsigned (algorithm NONE)")),
        other => return Err(bad(format!("unknown signature algorithm {}", other))),
    };
    if stored_hash != computed.as_slice() {
        return Err(bad("vbmeta digest mismatch"));
    }

    let public_key = slice(aux_block, public_key_offset, public_key_size)?.to_vec();
    if public_key.is_empty() {
        return Err(bad("vbmeta carries no public key"));
    }

    let descriptors = slice(aux_block, descriptors_offset, descriptors_size)?;
    let descriptor = parse_hashtree_descriptor(descriptors)?;

    Ok(VerityData {
        descriptor,
        public_key,
    })
}

/// Walk the descriptor list and decode the (single) hashtree descriptor.
fn parse_hashtree_descriptor(mut descriptors: &[u8]) -> Result<HashtreeDescriptor> {
    while descriptors.len() >= 16 {
        let tag = be_u64(descriptors, 0)?;
        let num_bytes = be_u64(descriptors, 8)? as usize;
        let payload = slice(descriptors, 16, num_bytes)?;

        if tag == HASHTREE_DESCRIPTOR_TAG {
            return decode_hashtree_payload(payload);
        }
        descriptors = &descriptors[16 + num_bytes..];
    }
    Err(bad("no hashtree descriptor in signature block"))
}

fn decode_hashtree_payload(payload: &[u8]) -> Result<HashtreeDescriptor> {
    if payload.len() < HASHTREE_FIXED_SIZE {
        return Err(bad("hashtree descriptor truncated"));
    }

    let dm_verity_version = be_u32(payload, 0)?;
    let image_size = be_u64(payload, 4)?;
    let tree_offset = be_u64(payload, 12)?;
    let data_block_size = be_u32(payload, 28)?;
    let hash_block_size = be_u32(payload, 32)?;

    let algorithm_bytes = slice(payload, 56, 32)?;
    let end = algorithm_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(algorithm_bytes.len());
    let hash_algorithm = std::str::from_utf8(&algorithm_bytes[..end])
        .map_err(|_| bad("hash algorithm name is not UTF-8"))?
        .to_string();

    let partition_name_len = be_u32(payload, 88)? as usize;
    let salt_len = be_u32(payload, 92)? as usize;
    let root_digest_len = be_u32(payload, 96)? as usize;

    let salt_start = HASHTREE_FIXED_SIZE + partition_name_len;
    let salt = slice(payload, salt_start, salt_len)?.to_vec();
    let root_digest = slice(payload, salt_start + salt_len, root_digest_len)?.to_vec();

    if data_block_size == 0 || hash_block_size == 0 {
        return Err(bad("hashtree descriptor has zero block size"));
    }
    if root_digest.is_empty() {
        return Err(bad("hashtree descriptor has no root digest"));
    }

    Ok(HashtreeDescriptor {
        dm_verity_version,
        image_size,
        tree_offset,
        data_block_size,
        hash_block_size,
        hash_algorithm,
        root_digest,
        salt,
    })
}

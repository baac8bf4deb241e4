// tests/common/mod.rs

//! Shared test utilities: builds complete package files (zip container,
//! stored image entry, verified-boot metadata) that the production
//! signature reader accepts, plus a TempDir-rooted daemon config.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::TempDir;
use zip::write::FileOptions;
use zip::ZipWriter;

use apexd::ApexdConfig;

/// Config with every path under a temporary root.
pub fn test_config(root: &TempDir) -> ApexdConfig {
    let base = root.path();
    ApexdConfig {
        apex_root: base.join("apex"),
        system_dir: base.join("system/apex"),
        active_dir: base.join("data/apex/active"),
        sessions_dir: base.join("data/apex/sessions"),
        key_dirs: vec![
            base.join("system/etc/security/apex"),
            base.join("product/etc/security/apex"),
        ],
        status_file: base.join("run/apexd/apexd.status"),
        lock_file: base.join("run/apexd/apexd.lock"),
        force_verity_on_system: false,
    }
}

/// The signing key bytes a test package for `name` embeds by default.
pub fn key_for(name: &str) -> Vec<u8> {
    format!("test-key:{}", name).into_bytes()
}

/// Install the trusted key for `name` into the first key directory.
pub fn trust_key(config: &ApexdConfig, name: &str) {
    let dir = &config.key_dirs[0];
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(format!("{}.avbpubkey", name)), key_for(name)).unwrap();
}

/// Builder for complete, verifiable package files.
pub struct PackageBuilder {
    name: String,
    version: u64,
    pre_install_hook: Option<String>,
    post_install_hook: Option<String>,
    key: Vec<u8>,
}

impl PackageBuilder {
    pub fn new(name: &str, version: u64) -> Self {
        Self {
            name: name.to_string(),
            version,
            pre_install_hook: None,
            post_install_hook: None,
            key: key_for(name),
        }
    }

    pub fn key(mut self, key: &[u8]) -> Self {
        self.key = key.to_vec();
        self
    }

    pub fn pre_install_hook(mut self, hook: &str) -> Self {
        self.pre_install_hook = Some(hook.to_string());
        self
    }

    pub fn post_install_hook(mut self, hook: &str) -> Self {
        self.post_install_hook = Some(hook.to_string());
        self
    }

    pub fn manifest(&self) -> String {
        let mut fields = vec![
            format!(r#""name":"{}""#, self.name),
            format!(r#""version":{}"#, self.version),
        ];
        if let Some(hook) = &self.pre_install_hook {
            fields.push(format!(r#""pre_install_hook":"{}""#, hook));
        }
        if let Some(hook) = &self.post_install_hook {
            fields.push(format!(r#""post_install_hook":"{}""#, hook));
        }
        format!("{{{}}}", fields.join(","))
    }

    /// Write the package file and return its path.
    pub fn write_to(&self, path: &Path) -> PathBuf {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let file = fs::File::create(path).unwrap();
        let mut writer = ZipWriter::new(file);
        let stored = FileOptions::default().compression_method(zip::CompressionMethod::Stored);

        writer.start_file("manifest.json", stored).unwrap();
        writer.write_all(self.manifest().as_bytes()).unwrap();
        writer.start_file("image.img", stored).unwrap();
        writer.write_all(&build_image(&self.key)).unwrap();
        writer.finish().unwrap();
        path.to_path_buf()
    }
}

// --- Verified-boot metadata construction ---
//
// Layout produced: 4096 bytes of payload, the vbmeta blob, zero padding,
// and the 64-byte footer at the very end of the image entry.

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn push_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn build_hashtree_descriptor() -> Vec<u8> {
    let partition_name = b"payload";
    let salt = [0xCDu8; 32];
    let root_digest = [0xABu8; 32];

    let mut payload = Vec::new();
    push_u32(&mut payload, 1); // dm-verity version
    push_u64(&mut payload, 4096); // image size
    push_u64(&mut payload, 4096); // tree offset
    push_u64(&mut payload, 4096); // tree size
    push_u32(&mut payload, 4096); // data block size
    push_u32(&mut payload, 4096); // hash block size
    push_u32(&mut payload, 0); // fec roots
    push_u64(&mut payload, 0); // fec offset
    push_u64(&mut payload, 0); // fec size
    let mut algorithm = [0u8; 32];
    algorithm[..6].copy_from_slice(b"sha256");
    payload.extend_from_slice(&algorithm);
    push_u32(&mut payload, partition_name.len() as u32);
    push_u32(&mut payload, salt.len() as u32);
    push_u32(&mut payload, root_digest.len() as u32);
    push_u32(&mut payload, 0); // flags
    payload.extend_from_slice(&[0u8; 60]);
    payload.extend_from_slice(partition_name);
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&root_digest);
    while payload.len() % 8 != 0 {
        payload.push(0);
    }

    let mut descriptor = Vec::new();
    push_u64(&mut descriptor, 1); // hashtree tag
    push_u64(&mut descriptor, payload.len() as u64);
    descriptor.extend_from_slice(&payload);
    descriptor
}

fn build_vbmeta(public_key: &[u8]) -> Vec<u8> {
    let descriptors = build_hashtree_descriptor();

    let mut aux = descriptors.clone();
    let public_key_offset = aux.len();
    aux.extend_from_slice(public_key);
    while aux.len() % 64 != 0 {
        aux.push(0);
    }

    let hash_size = 32usize;
    let mut auth = vec![0u8; hash_size];
    while auth.len() % 64 != 0 {
        auth.push(0);
    }

    let mut header = Vec::with_capacity(256);
    header.extend_from_slice(b"AVB0");
    push_u32(&mut header, 1); // required libavb major
    push_u32(&mut header, 0); // required libavb minor
    push_u64(&mut header, auth.len() as u64);
    push_u64(&mut header, aux.len() as u64);
    push_u32(&mut header, 1); // SHA256_RSA2048
    push_u64(&mut header, 0); // hash offset
    push_u64(&mut header, hash_size as u64);
    push_u64(&mut header, hash_size as u64); // signature offset
    push_u64(&mut header, 0); // signature size
    push_u64(&mut header, public_key_offset as u64);
    push_u64(&mut header, public_key.len() as u64);
    push_u64(&mut header, 0); // key metadata offset
    push_u64(&mut header, 0); // key metadata size
    push_u64(&mut header, 0); // descriptors offset
    push_u64(&mut header, descriptors.len() as u64);
    push_u64(&mut header, 0); // rollback index
    push_u32(&mut header, 0); // flags
    header.resize(256, 0);

    let mut hasher = Sha256::new();
    hasher.update(&header);
    hasher.update(&aux);
    let digest = hasher.finalize();
    auth[..hash_size].copy_from_slice(&digest);

    let mut vbmeta = header;
    vbmeta.extend_from_slice(&auth);
    vbmeta.extend_from_slice(&aux);
    vbmeta
}

fn build_image(public_key: &[u8]) -> Vec<u8> {
    let vbmeta = build_vbmeta(public_key);
    let vbmeta_offset = 4096u64;

    let mut image = vec![0u8; vbmeta_offset as usize];
    image.extend_from_slice(&vbmeta);
    while image.len() % 4096 != 0 {
        image.push(0);
    }

    let mut footer = Vec::with_capacity(64);
    footer.extend_from_slice(b"AVBf");
    push_u32(&mut footer, 1); // footer version major
    push_u32(&mut footer, 0); // footer version minor
    push_u64(&mut footer, vbmeta_offset); // original image size
    push_u64(&mut footer, vbmeta_offset);
    push_u64(&mut footer, vbmeta.len() as u64);
    footer.resize(64, 0);
    image.extend_from_slice(&footer);
    image
}

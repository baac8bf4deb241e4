// src/loopdev.rs

//! Loop device management
//!
//! Binds a byte range of a package file to a kernel loop-block device so
//! the embedded filesystem image can be mounted without extraction. Every
//! device configured here carries an identifier tag beginning with `apex:`
//! so the orphan sweep never disturbs loop devices owned by anyone else.
//!
//! `LoopDevice` is a scoped resource: dropping an uncommitted handle
//! detaches the device. The happy path calls `commit()` once the mount
//! holds its own reference.

use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Identifier tag prefix reserved by this daemon
pub const LOOP_ID_PREFIX: &str = "apex:";

const LOOP_CONTROL: &str = "/dev/loop-control";
const LOOP_DEV_DIR: &str = "/dev/block";

/// Bounded allocation retries; loop numbers handed out by the control
/// device can be stolen by concurrent allocators before we bind them.
const SETUP_ATTEMPTS: usize = 3;

const READ_AHEAD_KB: &str = "128";

// <linux/loop.h>
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_GET_STATUS64: libc::c_ulong = 0x4C05;
const LOOP_SET_DIRECT_IO: libc::c_ulong = 0x4C08;
const LOOP_SET_BLOCK_SIZE: libc::c_ulong = 0x4C09;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;
// <linux/fs.h> BLKFLSBUF = _IO(0x12, 97)
const BLKFLSBUF: libc::c_ulong = 0x1261;

const LO_FLAGS_READ_ONLY: u32 = 1;
const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

// Not exported by the libc crate.
#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

fn copy_name(dst: &mut [u8; LO_NAME_SIZE], src: &str) {
    let bytes = src.as_bytes();
    let n = bytes.len().min(LO_NAME_SIZE - 1);
    dst[..n].copy_from_slice(&bytes[..n]);
}

fn loop_err(context: &str) -> Error {
    Error::Loop(format!("{}: {}", context, std::io::Error::last_os_error()))
}

/// A configured loop device, detached on drop unless committed
#[derive(Debug)]
pub struct LoopDevice {
    /// Device node path, e.g. `/dev/block/loop3`
    pub name: String,
    device: Option<File>,
}

impl LoopDevice {
    /// Accept the device as good: the handle stops owning teardown and the
    /// device node path is returned for bookkeeping.
    pub fn commit(mut self) -> String {
        self.device = None;
        std::mem::take(&mut self.name)
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            debug!("detaching uncommitted loop device {}", self.name);
            // SAFETY: LOOP_CLR_FD takes no argument and the fd is open.
            let rc = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD) };
            if rc < 0 {
                warn!(
                    "failed to detach loop device {}: {}",
                    self.name,
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

/// Reserve a free loop device and bind it to `[offset, offset + size)` of
/// `file`. Retries allocation up to 3 times with no backoff.
pub fn create(file: &Path, offset: u64, size: u64) -> Result<LoopDevice> {
    let mut attempt = 1;
    loop {
        match try_create(file, offset, size) {
            Ok(device) => return Ok(device),
            Err(e) if attempt < SETUP_ATTEMPTS => {
                debug!(
                    "loop device setup attempt {}/{} for {} failed: {}",
                    attempt,
                    SETUP_ATTEMPTS,
                    file.display(),
                    e
                );
                attempt += 1;
            }
            Err(e) => {
                return Err(Error::Loop(format!(
                    "could not create loop device for {}: {}",
                    file.display(),
                    e
                )))
            }
        }
    }
}

fn try_create(file: &Path, offset: u64, size: u64) -> Result<LoopDevice> {
    let control = OpenOptions::new()
        .read(true)
        .write(true)
        .open(LOOP_CONTROL)
        .map_err(|e| Error::Loop(format!("failed to open {}: {}", LOOP_CONTROL, e)))?;

    // SAFETY: LOOP_CTL_GET_FREE takes no argument; returns a device number.
    let number = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE) };
    if number < 0 {
        return Err(loop_err("LOOP_CTL_GET_FREE"));
    }

    let device_path = format!("{}/loop{}", LOOP_DEV_DIR, number);
    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&device_path)
        .map_err(|e| Error::Loop(format!("failed to open {}: {}", device_path, e)))?;
    let backing = File::open(file)
        .map_err(|e| Error::Loop(format!("failed to open {}: {}", file.display(), e)))?;

    // SAFETY: LOOP_SET_FD binds the open backing fd to the loop device.
    let rc = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_SET_FD, backing.as_raw_fd()) };
    if rc < 0 {
        return Err(loop_err("LOOP_SET_FD"));
    }

    // From here on the device is bound; hand teardown to the handle.
    let device_fd = device.as_raw_fd();
    let handle = LoopDevice {
        name: device_path,
        device: Some(device),
    };

    // SAFETY: LoopInfo64 is plain-old-data; an all-zero value is valid.
    let mut info: LoopInfo64 = unsafe { std::mem::zeroed() };
    info.lo_offset = offset;
    info.lo_sizelimit = size;
    info.lo_flags = LO_FLAGS_READ_ONLY;
    copy_name(&mut info.lo_file_name, &file.display().to_string());
    copy_name(
        &mut info.lo_crypt_name,
        &format!("{}{}", LOOP_ID_PREFIX, file.display()),
    );
    // SAFETY: info is a valid LoopInfo64 and outlives the call.
    let rc = unsafe { libc::ioctl(device_fd, LOOP_SET_STATUS64, &info as *const LoopInfo64) };
    if rc < 0 {
        return Err(loop_err("LOOP_SET_STATUS64"));
    }

    // Drop any pages cached for the device before the range was configured;
    // without this the first superblock read can observe stale bytes from
    // offset 0 of the backing file.
    // SAFETY: BLKFLSBUF takes no argument.
    let rc = unsafe { libc::ioctl(device_fd, BLKFLSBUF, 0) };
    if rc < 0 {
        return Err(loop_err("BLKFLSBUF"));
    }

    // Both of these are unsupported on older kernels; degraded performance
    // is acceptable there.
    // SAFETY: LOOP_SET_BLOCK_SIZE takes the block size as the argument.
    let rc = unsafe { libc::ioctl(device_fd, LOOP_SET_BLOCK_SIZE, 4096) };
    if rc < 0 {
        warn!(
            "failed to set block size on {}: {}",
            handle.name,
            std::io::Error::last_os_error()
        );
    }
    // SAFETY: LOOP_SET_DIRECT_IO takes a boolean argument.
    let rc = unsafe { libc::ioctl(device_fd, LOOP_SET_DIRECT_IO, 1) };
    if rc < 0 {
        warn!(
            "failed to enable direct I/O on {}: {}",
            handle.name,
            std::io::Error::last_os_error()
        );
    }

    configure_read_ahead(&handle.name)?;

    debug!("loop device {} bound to {}", handle.name, file.display());
    Ok(handle)
}

/// Write the fixed read-ahead value for a block device node path, e.g.
/// `/dev/block/loop3` or `/dev/block/dm-4`.
pub fn configure_read_ahead(dev_path: &str) -> Result<()> {
    let node = Path::new(dev_path)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Loop(format!("invalid device path {}", dev_path)))?;
    let sysfs = format!("/sys/block/{}/queue/read_ahead_kb", node);
    fs::write(&sysfs, READ_AHEAD_KB)
        .map_err(|e| Error::Loop(format!("failed to write {}: {}", sysfs, e)))?;
    Ok(())
}

/// Detach the loop device at `dev_path`. Used when the owning record is
/// removed from the registry.
pub fn release(dev_path: &str) -> Result<()> {
    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open(dev_path)
        .map_err(|e| Error::Loop(format!("failed to open {}: {}", dev_path, e)))?;
    // SAFETY: LOOP_CLR_FD takes no argument.
    let rc = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD) };
    if rc < 0 {
        return Err(loop_err(&format!("LOOP_CLR_FD on {}", dev_path)));
    }
    debug!("released loop device {}", dev_path);
    Ok(())
}

/// Detach every loop device whose identifier tag begins with our prefix.
/// Only the startup sweep calls this; per-package teardown is targeted.
pub fn destroy_orphans() -> Result<()> {
    let mut destroyed = 0usize;
    for entry in fs::read_dir(LOOP_DEV_DIR)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("loop") || !name[4..].chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let path = entry.path();
        let device = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("failed to open {}: {}", path.display(), e);
                continue;
            }
        };

        // SAFETY: LoopInfo64 is plain-old-data; an all-zero value is valid.
        let mut info: LoopInfo64 = unsafe { std::mem::zeroed() };
        // SAFETY: info is a valid out-pointer for LOOP_GET_STATUS64.
        let rc =
            unsafe { libc::ioctl(device.as_raw_fd(), LOOP_GET_STATUS64, &mut info as *mut _) };
        if rc < 0 {
            // ENXIO: device exists but nothing is bound to it.
            continue;
        }
        if !info.lo_crypt_name.starts_with(LOOP_ID_PREFIX.as_bytes()) {
            continue;
        }

        // SAFETY: LOOP_CLR_FD takes no argument.
        let rc = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD) };
        if rc < 0 {
            warn!(
                "failed to detach orphan loop device {}: {}",
                path.display(),
                std::io::Error::last_os_error()
            );
        } else {
            destroyed += 1;
        }
    }
    if destroyed > 0 {
        info!("destroyed {} orphan loop devices", destroyed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_name_truncates() {
        let mut buf = [0u8; LO_NAME_SIZE];
        let long = "x".repeat(100);
        copy_name(&mut buf, &long);
        assert_eq!(&buf[..LO_NAME_SIZE - 1], "x".repeat(63).as_bytes());
        // Always NUL-terminated.
        assert_eq!(buf[LO_NAME_SIZE - 1], 0);
    }

    #[test]
    fn test_copy_name_tag_prefix() {
        let mut buf = [0u8; LO_NAME_SIZE];
        copy_name(&mut buf, &format!("{}/data/apex/active/a.apex", LOOP_ID_PREFIX));
        assert!(buf.starts_with(LOOP_ID_PREFIX.as_bytes()));
    }

    #[test]
    fn test_loop_info64_layout() {
        // The ioctl contract depends on the exact kernel struct size.
        assert_eq!(std::mem::size_of::<LoopInfo64>(), 232);
    }
}

// src/dm.rs

//! Device-mapper verity devices
//!
//! Builds a read-only `verity` target over a loop device so every block
//! read is checked against the package's signed hash tree. Talks to the
//! kernel through `/dev/mapper/control`; the node is named after the
//! package id, a namespace this daemon owns, so a pre-existing node of the
//! same name is deleted before creation.
//!
//! `VerityDevice` is a scoped resource: dropping an uncommitted handle
//! deletes the dm node.

use std::fs::{File, OpenOptions};
use std::mem;
use std::os::unix::io::AsRawFd;
use std::ptr;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::verity::HashtreeDescriptor;

const DM_CONTROL: &str = "/dev/mapper/control";

// Interface version we speak; the kernel rejects anything it cannot honor.
const DM_VERSION: [u32; 3] = [4, 0, 0];

const DM_BUF_SIZE: usize = 16 * 1024;
const DM_NAME_LEN: usize = 128;
const DM_UUID_LEN: usize = 129;
const DM_TARGET_TYPE_LEN: usize = 16;

// <linux/dm-ioctl.h> flags
const DM_READONLY_FLAG: u32 = 1;

// <linux/dm-ioctl.h> command numbers; all requests are _IOWR(0xfd, nr, dm_ioctl).
const DM_DEV_CREATE_CMD: u64 = 3;
const DM_DEV_REMOVE_CMD: u64 = 4;
const DM_DEV_SUSPEND_CMD: u64 = 6;
const DM_DEV_STATUS_CMD: u64 = 7;
const DM_TABLE_LOAD_CMD: u64 = 9;

#[repr(C)]
#[derive(Clone, Copy)]
struct DmIoctl {
    version: [u32; 3],
    data_size: u32,
    data_start: u32,
    target_count: u32,
    open_count: i32,
    flags: u32,
    event_nr: u32,
    padding: u32,
    dev: u64,
    name: [u8; DM_NAME_LEN],
    uuid: [u8; DM_UUID_LEN],
    data: [u8; 7],
}

#[repr(C)]
struct DmTargetSpec {
    sector_start: u64,
    length: u64,
    status: i32,
    next: u32,
    target_type: [u8; DM_TARGET_TYPE_LEN],
}

const fn dm_ioctl_cmd(nr: u64) -> libc::c_ulong {
    // _IOWR(0xfd, nr, struct dm_ioctl)
    ((3u64 << 30) | ((mem::size_of::<DmIoctl>() as u64) << 16) | (0xfd << 8) | nr) as libc::c_ulong
}

/// Verity table for a single package image: target length in 512-byte
/// sectors plus the kernel parameter string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityTable {
    pub num_sectors: u64,
    pub params: String,
}

/// Build the `verity` target arguments for `descriptor` over the block
/// device at `backing_device` (used as both data and hash device).
pub fn verity_table(descriptor: &HashtreeDescriptor, backing_device: &str) -> VerityTable {
    let params = format!(
        "{} {} {} {} {} {} {} {} {} {} 1 ignore_zero_blocks",
        descriptor.dm_verity_version,
        backing_device,
        backing_device,
        descriptor.data_block_size,
        descriptor.hash_block_size,
        descriptor.image_size / u64::from(descriptor.data_block_size),
        descriptor.tree_offset / u64::from(descriptor.hash_block_size),
        descriptor.hash_algorithm,
        hex::encode(&descriptor.root_digest),
        hex::encode(&descriptor.salt),
    );
    VerityTable {
        num_sectors: descriptor.image_size / 512,
        params,
    }
}

/// A created dm-verity node, deleted on drop unless committed
#[derive(Debug)]
pub struct VerityDevice {
    name: String,
    dev_path: String,
    committed: bool,
}

impl VerityDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dev_path(&self) -> &str {
        &self.dev_path
    }

    /// Accept the device as good; returns `(name, devPath)`.
    pub fn commit(mut self) -> (String, String) {
        self.committed = true;
        (mem::take(&mut self.name), mem::take(&mut self.dev_path))
    }
}

impl Drop for VerityDevice {
    fn drop(&mut self) {
        if !self.committed {
            debug!("deleting uncommitted verity device {}", self.name);
            match DeviceMapper::open() {
                Ok(dm) => {
                    if let Err(e) = dm.remove_device(&self.name) {
                        warn!("failed to delete verity device {}: {}", self.name, e);
                    }
                }
                Err(e) => warn!("failed to open device-mapper control: {}", e),
            }
        }
    }
}

/// Handle on `/dev/mapper/control`
pub struct DeviceMapper {
    control: File,
}

impl DeviceMapper {
    pub fn open() -> Result<Self> {
        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open(DM_CONTROL)
            .map_err(|e| Error::Dm(format!("failed to open {}: {}", DM_CONTROL, e)))?;
        Ok(Self { control })
    }

    /// Create a verity device named `name` serving `table`. An existing
    /// node of the same name is deleted first. The returned handle is
    /// scoped; commit it once the mount is in place.
    pub fn create_verity_device(&self, name: &str, table: &VerityTable) -> Result<VerityDevice> {
        if self.device_exists(name)? {
            warn!("deleting existing dm device {}", name);
            self.remove_device(name)?;
        }

        let created = self
            .issue(DM_DEV_CREATE_CMD, name, 0, 0, &[])
            .map_err(|e| dm_err("DM_DEV_CREATE", name, e))?;
        let device = VerityDevice {
            name: name.to_string(),
            dev_path: dev_path_for(created.dev),
            committed: false,
        };

        self.load_verity_table(name, table)?;
        // DM_DEV_SUSPEND without the suspend flag resumes the device,
        // activating the loaded table.
        self.issue(DM_DEV_SUSPEND_CMD, name, 0, 0, &[])
            .map_err(|e| dm_err("DM_DEV_SUSPEND", name, e))?;

        debug!("created verity device {} at {}", name, device.dev_path);
        Ok(device)
    }

    fn load_verity_table(&self, name: &str, table: &VerityTable) -> Result<()> {
        let spec_size = mem::size_of::<DmTargetSpec>();
        let mut params = table.params.clone().into_bytes();
        params.push(0);
        while params.len() % 8 != 0 {
            params.push(0);
        }

        let spec = DmTargetSpec {
            sector_start: 0,
            length: table.num_sectors,
            status: 0,
            next: (spec_size + params.len()) as u32,
            target_type: {
                let mut t = [0u8; DM_TARGET_TYPE_LEN];
                t[..6].copy_from_slice(b"verity");
                t
            },
        };

        let mut payload = Vec::with_capacity(spec_size + params.len());
        // SAFETY: DmTargetSpec is repr(C) plain-old-data; reading its bytes
        // into the payload buffer is well-defined.
        payload.extend_from_slice(unsafe {
            std::slice::from_raw_parts(&spec as *const DmTargetSpec as *const u8, spec_size)
        });
        payload.extend_from_slice(&params);

        self.issue(DM_TABLE_LOAD_CMD, name, DM_READONLY_FLAG, 1, &payload)
            .map_err(|e| dm_err("DM_TABLE_LOAD", name, e))?;
        Ok(())
    }

    /// Delete the dm node named `name`.
    pub fn remove_device(&self, name: &str) -> Result<()> {
        self.issue(DM_DEV_REMOVE_CMD, name, 0, 0, &[])
            .map_err(|e| dm_err("DM_DEV_REMOVE", name, e))?;
        Ok(())
    }

    fn device_exists(&self, name: &str) -> Result<bool> {
        match self.issue(DM_DEV_STATUS_CMD, name, 0, 0, &[]) {
            Ok(_) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => Ok(false),
            Err(e) => Err(dm_err("DM_DEV_STATUS", name, e)),
        }
    }

    /// Issue a dm ioctl with an optional payload after the header; returns
    /// the header the kernel wrote back.
    fn issue(
        &self,
        cmd_nr: u64,
        name: &str,
        flags: u32,
        target_count: u32,
        payload: &[u8],
    ) -> std::io::Result<DmIoctl> {
        use std::io::{Error as IoError, ErrorKind};

        let header_size = mem::size_of::<DmIoctl>();
        if name.len() >= DM_NAME_LEN {
            return Err(IoError::new(
                ErrorKind::InvalidInput,
                format!("device name too long: {}", name),
            ));
        }
        if header_size + payload.len() > DM_BUF_SIZE {
            return Err(IoError::new(ErrorKind::InvalidInput, "payload too large"));
        }

        // SAFETY: DmIoctl is repr(C) plain-old-data; all-zero is valid.
        let mut header: DmIoctl = unsafe { mem::zeroed() };
        header.version = DM_VERSION;
        header.data_size = DM_BUF_SIZE as u32;
        header.data_start = header_size as u32;
        header.target_count = target_count;
        header.flags = flags;
        header.name[..name.len()].copy_from_slice(name.as_bytes());

        let mut buf = vec![0u8; DM_BUF_SIZE];
        // SAFETY: buf is at least header_size bytes and properly writable.
        unsafe { ptr::write_unaligned(buf.as_mut_ptr() as *mut DmIoctl, header) };
        buf[header_size..header_size + payload.len()].copy_from_slice(payload);

        // SAFETY: buf outlives the call and is DM_BUF_SIZE bytes, matching
        // the data_size announced in the header.
        let rc =
            unsafe { libc::ioctl(self.control.as_raw_fd(), dm_ioctl_cmd(cmd_nr), buf.as_mut_ptr()) };
        if rc < 0 {
            return Err(IoError::last_os_error());
        }

        // SAFETY: the kernel wrote a DmIoctl header back into buf.
        Ok(unsafe { ptr::read_unaligned(buf.as_ptr() as *const DmIoctl) })
    }
}

fn dm_err(op: &str, name: &str, err: std::io::Error) -> Error {
    Error::Dm(format!("{} for '{}' failed: {}", op, name, err))
}

/// Device node path for a dm device number. The kernel packs the minor in
/// the low byte plus bits 20+ of the huge encoding.
fn dev_path_for(dev: u64) -> String {
    let minor = (dev & 0xff) | ((dev >> 12) & 0xffffff00);
    format!("/dev/block/dm-{}", minor)
}

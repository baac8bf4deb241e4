// src/mount.rs

//! Mount engine
//!
//! Turns an opened package into a mounted directory and back. The image
//! path composes a loop device, the verity gate, an optional dm-verity
//! mapping, and the ext4 mount into one all-or-nothing sequence: every
//! intermediate resource is scoped and only committed once the mount is in
//! place, so a failure at any step leaves the system exactly as it was.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use tracing::{debug, info, warn};

use crate::config::ApexdConfig;
use crate::dm::{self, DeviceMapper, VerityDevice};
use crate::error::{Error, Result};
use crate::loopdev;
use crate::package::ApexFile;
use crate::registry::{MountedPackage, MountedRegistry};
use crate::verity::VerityVerifier;

const MOUNT_ATTEMPTS: usize = 5;
// The kernel creates the dm device before the hotplug agent creates its
// userspace node; mounting can transiently fail until the node appears.
// Bounded sleep-and-retry, not a busy wait.
const MOUNT_RETRY_DELAY: Duration = Duration::from_millis(50);

const EXT4_FLAGS: MsFlags = MsFlags::MS_NOATIME
    .union(MsFlags::MS_NODEV)
    .union(MsFlags::MS_DIRSYNC)
    .union(MsFlags::MS_RDONLY);

/// Removes the mount point directory on drop unless disarmed.
struct MountPointGuard<'a> {
    path: &'a Path,
    armed: bool,
}

impl<'a> MountPointGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for MountPointGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_dir(self.path) {
                warn!(
                    "could not remove mount point {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

/// Mount `apex` at `mount_point` and record the result in the registry.
///
/// On any failure the mount point directory is removed and all partially
/// constructed kernel resources are released; no record is emitted.
pub fn mount_package(
    config: &ApexdConfig,
    verifier: &VerityVerifier,
    registry: &mut MountedRegistry,
    apex: &ApexFile,
    mount_point: &Path,
) -> Result<()> {
    debug!("creating mount point {}", mount_point.display());
    fs::create_dir_all(mount_point).map_err(|e| {
        Error::Mount(format!(
            "could not create mount point {}: {}",
            mount_point.display(),
            e
        ))
    })?;
    let mut guard = MountPointGuard::new(mount_point);

    let record = if apex.is_flattened() {
        mount_flattened(config, apex, mount_point)?
    } else {
        mount_image(config, verifier, apex, mount_point)?
    };

    if let Err(e) = registry.add(record.clone(), false) {
        // The mount itself succeeded; undo it so the failed operation has
        // no observable effect.
        warn!("registry rejected mount of {}: {}", apex.package_id(), e);
        let _ = umount2(mount_point, MntFlags::MNT_DETACH | MntFlags::UMOUNT_NOFOLLOW);
        release_record_devices(&record);
        return Err(e);
    }

    guard.disarm();
    Ok(())
}

fn mount_flattened(
    config: &ApexdConfig,
    apex: &ApexFile,
    mount_point: &Path,
) -> Result<MountedPackage> {
    if !apex.path().starts_with(&config.system_dir) {
        return Err(Error::Mount(format!(
            "cannot activate flattened package {} outside {}",
            apex.path().display(),
            config.system_dir.display()
        )));
    }

    mount(
        Some(apex.path()),
        mount_point,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| {
        Error::Mount(format!(
            "bind-mounting flattened package {} failed: {}",
            apex.path().display(),
            e
        ))
    })?;

    info!(
        "successfully bind-mounted flattened package {} on {}",
        apex.path().display(),
        mount_point.display()
    );
    Ok(MountedPackage {
        name: apex.manifest().name.clone(),
        version: apex.manifest().version,
        path: apex.path().to_path_buf(),
        loop_device: String::new(),
        dm_device: String::new(),
        mount_point: mount_point.to_path_buf(),
    })
}

fn mount_image(
    config: &ApexdConfig,
    verifier: &VerityVerifier,
    apex: &ApexFile,
    mount_point: &Path,
) -> Result<MountedPackage> {
    let (image_offset, image_size) = apex
        .image_range()
        .ok_or_else(|| Error::Mount("package carries no image".to_string()))?;

    // The cryptographic gate. Recomputed on every mount, and passed before
    // any kernel resource is allocated for the package.
    let verity_data = verifier.verify(apex)?;

    let loop_device = loopdev::create(apex.path(), image_offset, image_size)?;
    debug!("loop device created: {}", loop_device.name);

    // Packages on the system partition are already covered by the
    // partition's own verity; their signature is still checked above.
    let on_system_partition = apex.path().starts_with(&config.system_dir);
    let mount_on_verity = config.force_verity_on_system || !on_system_partition;

    let mut verity_device: Option<VerityDevice> = None;
    let block_device = if mount_on_verity {
        let dm = DeviceMapper::open()?;
        let table = dm::verity_table(&verity_data.descriptor, &loop_device.name);
        let device = dm.create_verity_device(&apex.package_id(), &table)?;
        loopdev::configure_read_ahead(device.dev_path())?;
        let path = device.dev_path().to_string();
        verity_device = Some(device);
        path
    } else {
        loop_device.name.clone()
    };

    for attempt in 1..=MOUNT_ATTEMPTS {
        match mount(
            Some(Path::new(&block_device)),
            mount_point,
            Some("ext4"),
            EXT4_FLAGS,
            None::<&str>,
        ) {
            Ok(()) => {
                info!(
                    "successfully mounted package {} on {}",
                    apex.path().display(),
                    mount_point.display()
                );

                // Accept the temporaries as good.
                let dm_name = match verity_device {
                    Some(device) => device.commit().0,
                    None => String::new(),
                };
                let loop_name = loop_device.commit();

                return Ok(MountedPackage {
                    name: apex.manifest().name.clone(),
                    version: apex.manifest().version,
                    path: apex.path().to_path_buf(),
                    loop_device: loop_name,
                    dm_device: dm_name,
                    mount_point: mount_point.to_path_buf(),
                });
            }
            Err(e) => {
                debug!(
                    "mount attempt {}/{} for {} failed: {}",
                    attempt,
                    MOUNT_ATTEMPTS,
                    apex.package_id(),
                    e
                );
                if attempt < MOUNT_ATTEMPTS {
                    thread::sleep(MOUNT_RETRY_DELAY);
                }
            }
        }
    }

    Err(Error::Mount(format!(
        "mounting failed for package {}",
        apex.path().display()
    )))
}

/// Unmount the instance of `apex` recorded in the registry.
///
/// Refuses to touch the instance currently published as latest; the alias
/// must be flipped first by a higher-level operation. The registry record
/// is removed as soon as the unmount succeeds so lookups stay consistent
/// even if the remaining cleanup is imperfect.
pub fn unmount_package(registry: &mut MountedRegistry, apex: &ApexFile) -> Result<()> {
    let name = &apex.manifest().name;
    debug!("unmounting {}", apex.package_id());

    let (record, latest) = registry
        .find(name, apex.path())
        .ok_or_else(|| Error::NotFound(format!("did not find {}", apex.path().display())))?;
    if latest {
        return Err(Error::IsActive(format!(
            "package {} is active",
            apex.path().display()
        )));
    }

    // Lazily detach whatever is mounted there.
    match umount2(
        &record.mount_point,
        MntFlags::MNT_DETACH | MntFlags::UMOUNT_NOFOLLOW,
    ) {
        Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => {}
        Err(e) => {
            return Err(Error::Mount(format!(
                "failed to unmount {}: {}",
                record.mount_point.display(),
                e
            )))
        }
    }

    registry.remove(name, apex.path());

    if let Err(e) = fs::remove_dir(&record.mount_point) {
        warn!(
            "failed to remove mount point {}: {}",
            record.mount_point.display(),
            e
        );
    }

    release_record_devices(&record);
    Ok(())
}

/// Best-effort release of the kernel devices named in a record. The
/// user-observable contract (nothing mounted) is already satisfied by the
/// time this runs, so failures are warnings.
fn release_record_devices(record: &MountedPackage) {
    if !record.dm_device.is_empty() {
        match DeviceMapper::open() {
            Ok(dm) => {
                if let Err(e) = dm.remove_device(&record.dm_device) {
                    warn!("failed to delete dm device {}: {}", record.dm_device, e);
                }
            }
            Err(e) => warn!("failed to open device-mapper control: {}", e),
        }
    }
    if !record.loop_device.is_empty() {
        if let Err(e) = loopdev::release(&record.loop_device) {
            warn!("failed to release loop device {}: {}", record.loop_device, e);
        }
    }
}

/// Publish `source_mount_point` at the name-only alias `alias`, replacing
/// whatever the alias currently points at.
pub fn bind_mount_latest(alias: &Path, source_mount_point: &Path) -> Result<()> {
    fs::create_dir_all(alias).map_err(|e| {
        Error::Mount(format!(
            "could not create alias directory {}: {}",
            alias.display(),
            e
        ))
    })?;

    // Detach the previous binding, if any, before publishing the new one.
    match umount2(alias, MntFlags::MNT_DETACH | MntFlags::UMOUNT_NOFOLLOW) {
        Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => {}
        Err(e) => {
            return Err(Error::Mount(format!(
                "failed to unmount alias {}: {}",
                alias.display(),
                e
            )))
        }
    }

    mount(
        Some(source_mount_point),
        alias,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| {
        Error::Mount(format!(
            "bind-mounting {} at {}: {}",
            source_mount_point.display(),
            alias.display(),
            e
        ))
    })
}

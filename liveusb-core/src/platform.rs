//! Provides platform-specific functionality.
//!
//! Every host platform exposes the same [`DeviceBackend`] capability
//! interface: drive discovery with hotplug notifications, mounting, free
//! space, labelling, formatting, boot-record and boot-flag handling, and the
//! extraction and bootloader steps that shell out to platform tools.
//!
//! The implementation is chosen at compile time with `#[cfg]`, and
//! [`native`] hands back the one for the running host. Each backend owns its
//! drive [`Inventory`] and its process [`Supervisor`]; nothing is global.
use crate::device::{Drive, DriveEvent};
use crate::error::{Error, Result};
use crate::inventory::Inventory;
use crate::options::InstallOptions;
use crate::policy::Filesystems;
use crate::process::Supervisor;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use tracing::debug;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::LinuxBackend;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::WindowsBackend;

/// Proxy settings by protocol (`http`, `ftp`, ...).
pub type Proxies = BTreeMap<String, String>;

/// The operations the installation pipeline needs from the host.
pub trait DeviceBackend: Send + Sync {
    /// The drives this backend currently knows about.
    fn inventory(&self) -> &Arc<Inventory>;

    /// The supervisor running this backend's external tools.
    fn supervisor(&self) -> &Arc<Supervisor>;

    /// Filesystems a target may carry on this host.
    fn accepted_filesystems(&self) -> &Filesystems;

    /// Enumerates removable drives into the inventory and starts watching for
    /// hotplug events. Every later change is delivered on the returned channel.
    fn detect_removable_drives(&self) -> Result<Receiver<DriveEvent>>;

    /// Mounts the drive unless it already is, and returns the mount point.
    fn mount_device(&self, key: &str) -> Result<PathBuf>;

    fn unmount_device(&self, key: &str) -> Result<()>;

    /// Free bytes on the drive's mounted filesystem.
    fn free_bytes(&self, drive: &Drive) -> Result<u64>;

    /// Rewrites the volume label.
    fn set_label(&self, drive: &Drive, label: &str) -> Result<()>;

    /// Formats the drive as FAT32 with the given label. Destroys all data.
    fn format_device(&self, drive: &Drive, label: &str) -> Result<()>;

    /// The first two bytes of the whole disk, as uppercase hex.
    fn master_boot_record(&self, drive: &Drive) -> Option<String> {
        let mbr = read_boot_signature(drive.whole_disk());
        debug!("mbr of {} = {mbr:?}", drive.whole_disk().display());
        mbr
    }

    /// True when the boot code area starts out zeroed.
    fn blank_master_boot_record(&self, drive: &Drive) -> bool {
        self.master_boot_record(drive).as_deref() == Some("0000")
    }

    /// True when the boot code matches the one `syslinux` ships.
    fn mbr_matches_syslinux(&self, _drive: &Drive) -> bool {
        true
    }

    /// Writes the `syslinux` boot code onto the whole disk.
    fn reset_master_boot_record(&self, _drive: &Drive) -> Result<()> {
        Ok(())
    }

    /// Sets the boot flag on the drive's partition, if it is one.
    fn bootable_partition(&self, _drive: &Drive) -> Result<()> {
        Ok(())
    }

    fn flush_buffers(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the process has administrator rights, `None` if unknown.
    fn is_admin(&self) -> Option<bool>;

    /// Proxy settings configured for the user; empty when none or unknown.
    fn proxy_settings(&self) -> Proxies {
        Proxies::new()
    }

    /// Checks the MD5 implanted in the image, where the host has a tool for it.
    fn verify_implanted_md5(&self, _image: &Path) -> Result<bool> {
        Ok(true)
    }

    /// Copies the live payload and boot assets from the image to `dest`.
    fn extract_image(&self, image: &Path, dest: &Path) -> Result<()>;

    /// Installs the bootloader. Expects the extracted `isolinux` directory
    /// under `dest` with its configuration already rewritten.
    fn install_bootloader(&self, drive: &Drive, dest: &Path, options: &InstallOptions)
    -> Result<()>;

    /// Writes the image byte-for-byte over the whole disk.
    fn write_raw_image(&self, _image: &Path, drive: &Drive) -> Result<()> {
        Err(Error::Precondition(format!(
            "Raw image writing to {} is not supported on this platform",
            drive.device.display()
        )))
    }

    /// The path to open for whole-device reads.
    fn raw_device_path(&self, drive: &Drive) -> PathBuf {
        drive.whole_disk().to_path_buf()
    }

    /// Size in bytes of what [`DeviceBackend::raw_device_path`] opens.
    fn raw_device_size(&self, drive: &Drive) -> u64 {
        drive.disk_size
    }
}

/// Creates the backend for the running host.
///
/// `force` names a device that bypasses the enumeration filters.
#[cfg(target_os = "linux")]
pub fn native(force: Option<PathBuf>) -> Result<Box<dyn DeviceBackend>> {
    Ok(Box::new(LinuxBackend::new(force)?))
}

/// Creates the backend for the running host.
///
/// `force` names a device that bypasses the enumeration filters.
#[cfg(target_os = "windows")]
pub fn native(force: Option<PathBuf>) -> Result<Box<dyn DeviceBackend>> {
    Ok(Box::new(WindowsBackend::new(force)?))
}

/// Reads the first two bytes of a device as uppercase hex.
pub fn read_boot_signature(path: &Path) -> Option<String> {
    let mut buf = [0u8; 2];
    File::open(path).ok()?.read_exact(&mut buf).ok()?;
    Some(hex::encode_upper(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_signature_is_uppercase_hex() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("disk.img");
        std::fs::write(&disk, [0x33, 0xc0, 0x8e, 0xd0]).unwrap();
        assert_eq!(read_boot_signature(&disk).as_deref(), Some("33C0"));

        std::fs::write(&disk, [0u8; 512]).unwrap();
        assert_eq!(read_boot_signature(&disk).as_deref(), Some("0000"));

        assert_eq!(read_boot_signature(&dir.path().join("missing")), None);
    }
}

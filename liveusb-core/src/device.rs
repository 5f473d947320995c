use std::fmt;
use std::path::{Path, PathBuf};

/// A removable drive, or one partition of it, as tracked by the inventory.
///
/// Records are created by a platform backend when it enumerates devices or
/// observes a hotplug event. The backend keeps the authoritative copy; callers
/// hold on to the [`Drive::key`] and look the record up again when they need
/// it, so that a drive unplugged mid-run is noticed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Drive {
    /// Opaque, stable identifier (e.g. `sdb1` or `E:`). Not necessarily a path.
    pub key: String,
    /// The system path to the device (e.g. `/dev/sdb1` or `E:`).
    pub device: PathBuf,
    /// The whole disk this partition lives on, if it is a partition.
    pub parent: Option<PathBuf>,
    /// Filesystem type as reported by the OS (`vfat`, `ext4`, ...).
    pub fstype: String,
    pub fsversion: String,
    pub label: String,
    pub uuid: String,
    /// Current mount point, if mounted.
    pub mount: Option<PathBuf>,
    /// Size of this device (partition) in bytes.
    pub size: u64,
    /// Size of the whole disk in bytes; equal to `size` when there is no parent.
    pub disk_size: u64,
    /// Free bytes on the mounted filesystem, once known.
    pub free: Option<u64>,
    /// Vendor and model, for display.
    pub friendly_name: String,
}

impl Drive {
    /// Returns true when this drive is a partition on a larger disk.
    pub fn is_partition(&self) -> bool {
        self.parent.is_some()
    }

    /// The whole-disk path: the parent if this is a partition, else the device.
    pub fn whole_disk(&self) -> &Path {
        self.parent.as_deref().unwrap_or(&self.device)
    }
}

impl fmt::Display for Drive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = match &self.mount {
            Some(mount) => format!("[Mounted at {}]", mount.display()),
            None => "[Not mounted]".to_string(),
        };
        let size_gb = self.size as f64 / (1024.0 * 1024.0 * 1024.0);

        write!(
            f,
            "{:<15} {:.1} GB {:<6} {:<12} {} {}",
            self.device.display(),
            size_gb,
            self.fstype,
            self.label,
            self.friendly_name,
            mount_info
        )
    }
}

/// A change to the drive inventory, delivered on a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriveEvent {
    /// A drive keyed by this identifier appeared or was updated.
    Added(String),
    /// The drive keyed by this identifier is gone.
    Removed(String),
}

#[cfg(test)]
pub(crate) fn sample_drive(key: &str) -> Drive {
    Drive {
        key: key.to_string(),
        device: PathBuf::from(format!("/dev/{key}")),
        parent: None,
        fstype: "vfat".into(),
        fsversion: "FAT32".into(),
        label: "LIVE".into(),
        uuid: "1234-ABCD".into(),
        mount: None,
        size: 16 * 1024 * 1024 * 1024,
        disk_size: 16 * 1024 * 1024 * 1024,
        free: None,
        friendly_name: "Kingston DataTraveler".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_disk_resolves_through_parent() {
        let mut drive = sample_drive("sdb1");
        assert_eq!(drive.whole_disk(), Path::new("/dev/sdb1"));
        assert!(!drive.is_partition());

        drive.parent = Some(PathBuf::from("/dev/sdb"));
        assert_eq!(drive.whole_disk(), Path::new("/dev/sdb"));
        assert!(drive.is_partition());
    }

    #[test]
    fn display_mentions_mount_state() {
        let mut drive = sample_drive("sdb1");
        assert!(drive.to_string().contains("[Not mounted]"));
        drive.mount = Some(PathBuf::from("/run/media/LIVE"));
        assert!(drive.to_string().contains("[Mounted at /run/media/LIVE]"));
    }
}

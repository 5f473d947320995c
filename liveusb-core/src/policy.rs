//! Which devices are offered as installation targets.
//!
//! Backends gather a [`Probe`] for every block device they see and hand it to
//! [`EnumerationPolicy::admit`]. The policy is deliberately platform-neutral
//! so that it can be tested without hardware.
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Filesystems `syslinux` can install to.
pub const FAT_FSTYPES: [&str; 2] = ["vfat", "msdos"];
/// Filesystems `extlinux` can install to, depending on its version.
pub const EXT_FSTYPES: [&str; 3] = ["ext2", "ext3", "ext4"];

/// Mount points that disqualify a device no matter what.
pub const PROTECTED_MOUNTS: [&str; 3] = ["/", "/boot", "/boot/efi"];

/// Buses over which a removable target may be attached.
const ACCEPTED_BUSES: [&str; 2] = ["usb", "sdio"];

/// The set of filesystem types a target may carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filesystems(BTreeSet<String>);

impl Filesystems {
    /// FAT only.
    pub fn fat() -> Self {
        Self(FAT_FSTYPES.iter().map(|s| s.to_string()).collect())
    }

    /// FAT plus whatever ext variants the installed `extlinux` handles.
    ///
    /// `None` means `extlinux` is not installed. Versions before 4 cannot
    /// install to ext4.
    pub fn for_extlinux(major_version: Option<u32>) -> Self {
        let mut set = Self::fat();
        if let Some(major) = major_version {
            for fs in EXT_FSTYPES {
                if fs != "ext4" || major >= 4 {
                    set.0.insert(fs.to_string());
                }
            }
        }
        set
    }

    pub fn contains(&self, fstype: &str) -> bool {
        self.0.contains(fstype)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Whether a filesystem cannot hold sparse files and must be zero-filled.
pub fn is_fat(fstype: &str) -> bool {
    FAT_FSTYPES.contains(&fstype)
}

/// Whether a filesystem is installed to with `extlinux` instead of `syslinux`.
pub fn is_ext(fstype: &str) -> bool {
    EXT_FSTYPES.contains(&fstype)
}

/// What a backend learned about one device before deciding to list it.
#[derive(Clone, Debug, Default)]
pub struct Probe {
    pub device: PathBuf,
    pub removable: bool,
    pub optical: bool,
    /// Connection bus (`usb`, `sdio`, `ata`, ...), if the platform reports one.
    pub bus: Option<String>,
    /// True if this device lives on the disk the running system booted from.
    pub on_system_disk: bool,
    pub mounts: Vec<PathBuf>,
    pub size: u64,
    pub fstype: String,
}

/// Why a device was left out of the inventory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Skip {
    ProtectedMount(PathBuf),
    SystemDisk,
    NotRemovable,
    Optical,
    Bus(String),
    NoSize,
    Filesystem(String),
}

impl fmt::Display for Skip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Skip::ProtectedMount(p) => write!(f, "mounted at boot path {}", p.display()),
            Skip::SystemDisk => write!(f, "on the system disk"),
            Skip::NotRemovable => write!(f, "not removable"),
            Skip::Optical => write!(f, "optical"),
            Skip::Bus(bus) => write!(f, "connected via {bus}"),
            Skip::NoSize => write!(f, "no size"),
            Skip::Filesystem(fs) => write!(f, "unknown filesystem '{fs}'"),
        }
    }
}

/// The filter applied to every probed device.
#[derive(Clone, Debug)]
pub struct EnumerationPolicy {
    pub accepted: Filesystems,
    /// A device path that bypasses every overridable filter.
    pub force: Option<PathBuf>,
}

impl EnumerationPolicy {
    pub fn new(accepted: Filesystems, force: Option<PathBuf>) -> Self {
        Self { accepted, force }
    }

    fn forced(&self, device: &Path) -> bool {
        self.force.as_deref() == Some(device)
    }

    /// Returns `Ok(())` if the device may be listed.
    ///
    /// Naming the exact device in [`EnumerationPolicy::force`] overrides the
    /// removable, optical, bus, size and filesystem filters. It does not
    /// override the root-device filter: a device mounted at a protected path
    /// or living on the system disk is refused even when forced, which is
    /// stricter than the force rule applied to every other filter.
    pub fn admit(&self, probe: &Probe) -> Result<(), Skip> {
        if let Some(mount) = probe
            .mounts
            .iter()
            .find(|m| PROTECTED_MOUNTS.iter().any(|p| Path::new(p) == m.as_path()))
        {
            return Err(Skip::ProtectedMount(mount.clone()));
        }
        if probe.on_system_disk {
            return Err(Skip::SystemDisk);
        }
        if self.forced(&probe.device) {
            return Ok(());
        }
        if !probe.removable {
            return Err(Skip::NotRemovable);
        }
        if probe.optical {
            return Err(Skip::Optical);
        }
        if let Some(bus) = &probe.bus {
            if !ACCEPTED_BUSES.contains(&bus.as_str()) {
                return Err(Skip::Bus(bus.clone()));
            }
        }
        if probe.size == 0 {
            return Err(Skip::NoSize);
        }
        if !self.accepted.contains(&probe.fstype) {
            return Err(Skip::Filesystem(probe.fstype.clone()));
        }
        Ok(())
    }
}

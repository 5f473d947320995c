use crate::checksum::HashAlgorithm;
use crate::error::{Error, Result};
use std::path::PathBuf;

/// The volume label given to a target when none is requested.
pub const DEFAULT_LABEL: &str = "LIVE";

/// Caller-supplied settings for one installation run.
#[derive(Clone, Debug)]
pub struct InstallOptions {
    /// Volume label the target should carry.
    pub label: String,
    /// Size of the persistent overlay in MiB; 0 for none.
    pub overlay_mib: u64,
    /// Extra kernel arguments, comma separated.
    pub kernel_args: Option<String>,
    /// Device path that bypasses enumeration filters. Also passed to
    /// `syslinux -f`.
    pub force: Option<PathBuf>,
    /// Skip release catalog verification.
    pub no_verify: bool,
    /// Also run the implanted-MD5 check, where the platform supports it.
    pub verify_md5: bool,
    /// Algorithm for device checksums.
    pub hash: HashAlgorithm,
    /// Pass `-s` ("safe, slow and stupid") to `syslinux`.
    pub safe: bool,
    /// Also make the drive bootable on the OLPC XO.
    pub xo: bool,
    /// Restore the `syslinux` boot code when the current one is blank or foreign.
    pub reset_mbr: bool,
    /// Reformat the target as FAT32 before installing.
    pub format: bool,
    /// Write the image over the whole disk instead of installing a payload.
    pub raw: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            label: DEFAULT_LABEL.to_string(),
            overlay_mib: 0,
            kernel_args: None,
            force: None,
            no_verify: false,
            verify_md5: false,
            hash: HashAlgorithm::Sha1,
            safe: false,
            xo: false,
            reset_mbr: false,
            format: false,
            raw: false,
        }
    }
}

impl InstallOptions {
    /// Overlay size in bytes. Fails if the size does not fit in a `u64`.
    pub fn overlay_bytes(&self) -> Result<u64> {
        self.overlay_mib.checked_mul(1024 * 1024).ok_or_else(|| {
            Error::Precondition(format!(
                "A persistent overlay of {} MB is too large",
                self.overlay_mib
            ))
        })
    }

    /// The extra kernel arguments as separate words.
    pub fn kernel_args(&self) -> Vec<&str> {
        self.kernel_args
            .as_deref()
            .map(|args| {
                args.split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = InstallOptions::default();
        assert_eq!(options.label, "LIVE");
        assert_eq!(options.overlay_bytes().unwrap(), 0);
        assert!(options.kernel_args().is_empty());
    }

    #[test]
    fn kernel_args_split_on_commas() {
        let options = InstallOptions {
            kernel_args: Some("quiet, rhgb,,nomodeset".into()),
            overlay_mib: 512,
            ..Default::default()
        };
        assert_eq!(options.kernel_args(), vec!["quiet", "rhgb", "nomodeset"]);
        assert_eq!(options.overlay_bytes().unwrap(), 512 * 1024 * 1024);
    }

    #[test]
    fn oversized_overlay_is_rejected() {
        let options = InstallOptions {
            overlay_mib: u64::MAX / 1024,
            ..Default::default()
        };
        assert!(matches!(options.overlay_bytes(), Err(Error::Precondition(_))));

        let largest = InstallOptions {
            overlay_mib: u64::MAX / (1024 * 1024),
            ..Default::default()
        };
        assert!(largest.overlay_bytes().is_ok());
    }
}

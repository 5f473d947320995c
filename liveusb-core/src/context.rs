use crate::error::{Error, Result};
use crate::staging::StagedImage;
use std::path::{Path, PathBuf};

/// State carried from one pipeline step to the next.
///
/// The context owns nothing platform-specific: the drive is referred to by
/// its inventory key and looked up again at every step.
#[derive(Debug, Default)]
pub struct InstallationContext {
    /// The selected image, decompressed if it needed to be.
    pub image: Option<StagedImage>,
    /// Size of the (decompressed) image in bytes.
    pub image_size: u64,
    /// Inventory key of the target drive.
    pub drive: Option<String>,
    pub label: String,
    pub overlay_bytes: u64,
    pub kernel_args: Vec<String>,
    /// Where the target is mounted while the pipeline runs.
    pub dest: Option<PathBuf>,
    /// Extraction throughput, once measured.
    pub mb_per_sec: Option<f64>,
}

impl InstallationContext {
    pub fn image_path(&self) -> Option<&Path> {
        self.image.as_ref().map(StagedImage::path)
    }

    pub fn dest(&self) -> Option<&Path> {
        self.dest.as_deref()
    }

    /// Bytes the target must have free: the image plus the overlay.
    pub fn required_bytes(&self) -> Result<u64> {
        self.image_size
            .checked_add(self.overlay_bytes)
            .ok_or_else(|| Error::Precondition("The image and overlay are too large".into()))
    }
}

/// Megabytes per second for `bytes` copied in `seconds`; `None` when the
/// copy was too quick to measure.
pub fn throughput(bytes: u64, seconds: f64) -> Option<f64> {
    if seconds <= 0.0 {
        return None;
    }
    Some(bytes as f64 / seconds / (1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_bytes_adds_overlay() {
        let ctx = InstallationContext {
            image_size: 800,
            overlay_bytes: 100,
            ..Default::default()
        };
        assert_eq!(ctx.required_bytes().unwrap(), 900);
    }

    #[test]
    fn required_bytes_overflow_is_an_error() {
        let ctx = InstallationContext {
            image_size: u64::MAX - 10,
            overlay_bytes: 11,
            ..Default::default()
        };
        assert!(matches!(ctx.required_bytes(), Err(Error::Precondition(_))));
    }

    #[test]
    fn throughput_in_mib_per_second() {
        assert_eq!(throughput(100 * 1024 * 1024, 10.0), Some(10.0));
        assert_eq!(throughput(1, 0.0), None);
    }
}

//! The ordered installation pipeline.
//!
//! [`Installer`] walks a drive from "selected" to "bootable" through a fixed
//! sequence of [`Stage`]s. Each stage is a public method and depends on the
//! ones before it; [`Installer::run`] executes them all in order. A failure
//! aborts the run and leaves the drive as it was at that point, and a failed
//! stage may be re-invoked by the caller once the cause has been fixed.
use crate::bootcfg::{self, Rewrite};
use crate::checksum::{self, Verification};
use crate::context::{self, InstallationContext};
use crate::device::Drive;
use crate::error::{Error, Result};
use crate::olpc;
use crate::options::InstallOptions;
use crate::payload::{self, ISOLINUX_DIR};
use crate::platform::DeviceBackend;
use crate::release::ReleaseCatalog;
use crate::staging;
use std::cell::RefCell;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// One step of the pipeline, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    SelectImage,
    VerifyImage,
    SelectDrive,
    Format,
    VerifyFilesystem,
    CheckFreeSpace,
    DeleteExistingPayload,
    Mount,
    ResetMbr,
    ExtractImage,
    UpdateBootConfigs,
    InstallBootloader,
    CreatePersistentOverlay,
    BootablePartitionFlag,
    UnmountAndFlush,
    WriteRawImage,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Stage::SelectImage => "Selecting image",
            Stage::VerifyImage => "Verifying image",
            Stage::SelectDrive => "Selecting drive",
            Stage::Format => "Formatting device",
            Stage::VerifyFilesystem => "Verifying filesystem",
            Stage::CheckFreeSpace => "Checking free space",
            Stage::DeleteExistingPayload => "Removing existing Live OS",
            Stage::Mount => "Mounting device",
            Stage::ResetMbr => "Resetting Master Boot Record",
            Stage::ExtractImage => "Extracting live image to the target device",
            Stage::UpdateBootConfigs => "Updating boot configuration",
            Stage::InstallBootloader => "Installing bootloader",
            Stage::CreatePersistentOverlay => "Creating persistent overlay",
            Stage::BootablePartitionFlag => "Marking partition bootable",
            Stage::UnmountAndFlush => "Unmounting and flushing buffers",
            Stage::WriteRawImage => "Writing image to the whole disk",
        };
        f.write_str(text)
    }
}

/// Receives progress from a running pipeline. Every method defaults to
/// doing nothing.
pub trait Observer {
    fn stage(&mut self, _stage: Stage) {}

    /// Decompression of a compressed image has produced `bytes` so far.
    fn decompress_progress(&mut self, _bytes: u64) {}

    /// Image verification is starting over `kib` KiB.
    fn verify_started(&mut self, _kib: u64) {}

    fn verify_progress(&mut self, _kib: u64) {}
}

impl<F: FnMut(Stage)> Observer for F {
    fn stage(&mut self, stage: Stage) {
        self(stage)
    }
}

/// An observer that ignores everything.
pub struct Quiet;

impl Observer for Quiet {}

/// Fails unless `available` bytes can hold `required` bytes.
pub fn check_space(required: u64, available: u64) -> Result<()> {
    if required > available {
        return Err(Error::InsufficientSpace {
            required,
            available,
        });
    }
    Ok(())
}

/// Drives one installation against a [`DeviceBackend`].
pub struct Installer<'a> {
    backend: &'a dyn DeviceBackend,
    options: InstallOptions,
    catalog: ReleaseCatalog,
    ctx: InstallationContext,
}

impl<'a> Installer<'a> {
    /// Fails if the options describe an overlay too large to represent.
    pub fn new(backend: &'a dyn DeviceBackend, options: InstallOptions) -> Result<Self> {
        let ctx = InstallationContext {
            label: options.label.clone(),
            overlay_bytes: options.overlay_bytes()?,
            kernel_args: options.kernel_args().into_iter().map(str::to_string).collect(),
            ..Default::default()
        };
        Ok(Self {
            backend,
            options,
            catalog: ReleaseCatalog::default(),
            ctx,
        })
    }

    /// Sets the catalog images are verified against.
    pub fn with_catalog(mut self, catalog: ReleaseCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn context(&self) -> &InstallationContext {
        &self.ctx
    }

    pub fn options(&self) -> &InstallOptions {
        &self.options
    }

    /// Runs every stage in order.
    ///
    /// In raw mode the image is written over the whole disk instead, and
    /// nothing on the filesystem level happens.
    pub fn run(&mut self, image: &Path, drive: &str, observer: &mut dyn Observer) -> Result<()> {
        self.backend.supervisor().reset();

        observer.stage(Stage::SelectImage);
        self.select_image(image, observer)?;
        observer.stage(Stage::VerifyImage);
        self.verify_image(observer)?;
        observer.stage(Stage::SelectDrive);
        self.select_drive(drive)?;

        if self.options.raw {
            observer.stage(Stage::WriteRawImage);
            self.write_raw_image()?;
            observer.stage(Stage::UnmountAndFlush);
            return self.backend.flush_buffers();
        }

        if self.options.format {
            observer.stage(Stage::Format);
            self.format_drive()?;
        }
        observer.stage(Stage::VerifyFilesystem);
        self.verify_filesystem()?;
        observer.stage(Stage::CheckFreeSpace);
        self.check_free_space()?;
        observer.stage(Stage::DeleteExistingPayload);
        self.delete_existing_payload()?;
        observer.stage(Stage::Mount);
        self.mount()?;
        if self.options.reset_mbr {
            observer.stage(Stage::ResetMbr);
            self.reset_mbr()?;
        }
        observer.stage(Stage::ExtractImage);
        self.extract_image()?;
        observer.stage(Stage::UpdateBootConfigs);
        self.update_configs()?;
        observer.stage(Stage::InstallBootloader);
        self.install_bootloader()?;
        if self.ctx.overlay_bytes > 0 {
            observer.stage(Stage::CreatePersistentOverlay);
            self.create_persistent_overlay()?;
        }
        observer.stage(Stage::BootablePartitionFlag);
        self.bootable_partition();
        observer.stage(Stage::UnmountAndFlush);
        self.unmount_and_flush()?;

        info!("Complete!");
        Ok(())
    }

    /// Records the image and its size, decompressing it first if needed.
    pub fn select_image(&mut self, image: &Path, observer: &mut dyn Observer) -> Result<()> {
        let image = fs::canonicalize(image).unwrap_or_else(|_| image.to_path_buf());
        let staged = staging::stage_image(&image, self.backend.supervisor(), |bytes| {
            observer.decompress_progress(bytes)
        })?;
        self.ctx.image_size = staged.size()?;
        info!(
            "Selected image {} ({} bytes)",
            staged.source().display(),
            self.ctx.image_size
        );
        self.ctx.image = Some(staged);
        Ok(())
    }

    fn image(&self) -> Result<PathBuf> {
        self.ctx
            .image_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::Precondition("No image has been selected".into()))
    }

    /// Checks the image against its published checksum. An image missing
    /// from the catalog is only warned about.
    pub fn verify_image(&mut self, observer: &mut dyn Observer) -> Result<()> {
        let Some(staged) = self.ctx.image.as_ref() else {
            return Err(Error::Precondition("No image has been selected".into()));
        };
        if self.options.no_verify {
            info!("Skipping image verification");
            return Ok(());
        }

        // Published checksums cover the file as downloaded, which may be the
        // compressed one.
        let observer = RefCell::new(observer);
        let verification = checksum::verify_image_checksum(
            staged.source(),
            &self.catalog,
            |kib| observer.borrow_mut().verify_started(kib),
            |kib| observer.borrow_mut().verify_progress(kib),
        )?;

        match verification {
            Verification::Matched => info!("Image checksum verified"),
            Verification::Unknown => warn!(
                "{} is not a known release; its checksum cannot be verified",
                staged.source().display()
            ),
            Verification::Mismatched {
                algorithm,
                expected,
                actual,
            } => {
                return Err(Error::ChecksumMismatch {
                    image: staged.source().to_path_buf(),
                    algorithm: algorithm.to_string(),
                    expected,
                    actual,
                });
            }
        }

        if self.options.verify_md5 {
            info!("Verifying ISO MD5 checksum");
            if !self.backend.verify_implanted_md5(staged.path())? {
                return Err(Error::ChecksumMismatch {
                    image: staged.source().to_path_buf(),
                    algorithm: "implanted md5".into(),
                    expected: "the checksum embedded in the image".into(),
                    actual: "a different checksum".into(),
                });
            }
            info!("ISO MD5 checksum passed");
        }
        Ok(())
    }

    /// Resolves the target by inventory key or by device path.
    pub fn select_drive(&mut self, key_or_device: &str) -> Result<()> {
        let drive = self
            .backend
            .inventory()
            .find(key_or_device)
            .ok_or_else(|| Error::DeviceNotFound(key_or_device.to_string()))?;
        info!("Selected drive {}", drive.device.display());
        self.ctx.drive = Some(drive.key);
        self.ctx.dest = None;
        Ok(())
    }

    /// The current inventory record of the selected drive.
    pub fn drive(&self) -> Result<Drive> {
        let key = self
            .ctx
            .drive
            .as_deref()
            .ok_or_else(|| Error::Precondition("No drive has been selected".into()))?;
        self.backend
            .inventory()
            .get(key)
            .ok_or_else(|| Error::DeviceNotFound(key.to_string()))
    }

    fn dest(&self) -> Result<PathBuf> {
        self.ctx
            .dest()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::Precondition("The target device is not mounted".into()))
    }

    fn ensure_mounted(&mut self) -> Result<PathBuf> {
        let drive = self.drive()?;
        let dest = self.backend.mount_device(&drive.key)?;
        self.ctx.dest = Some(dest.clone());
        Ok(dest)
    }

    /// Reformats the target as FAT32 with the desired label.
    pub fn format_drive(&mut self) -> Result<()> {
        let drive = self.drive()?;
        if drive.mount.is_some() {
            self.backend.unmount_device(&drive.key)?;
        }
        self.ctx.dest = None;
        warn!("Formatting {} as FAT32", drive.device.display());
        self.backend.format_device(&drive, &self.ctx.label)
    }

    /// Checks the filesystem type and brings the label in line. Relabelling
    /// failures are logged, not fatal.
    pub fn verify_filesystem(&mut self) -> Result<()> {
        info!("Verifying filesystem...");
        let drive = self.drive()?;
        if drive.fstype.is_empty() || !self.backend.accepted_filesystems().contains(&drive.fstype) {
            return Err(Error::UnsupportedFilesystem {
                fstype: drive.fstype,
            });
        }
        if drive.label != self.ctx.label {
            info!("Setting {} label to {}", drive.device.display(), self.ctx.label);
            match self.backend.set_label(&drive, &self.ctx.label) {
                Ok(()) => {
                    let label = self.ctx.label.clone();
                    self.backend.inventory().update(&drive.key, |d| d.label = label);
                }
                Err(e) => error!("Unable to change volume label: {e}"),
            }
        }
        Ok(())
    }

    /// Fails unless the target can hold the image plus the overlay.
    pub fn check_free_space(&mut self) -> Result<()> {
        self.ensure_mounted()?;
        let drive = self.drive()?;
        let free = self.backend.free_bytes(&drive)?;
        self.backend.inventory().update(&drive.key, |d| d.free = Some(free));
        let required = self.ctx.required_bytes()?;
        debug!("freebytes = {free}");
        debug!("isosize = {}", self.ctx.image_size);
        check_space(required, free)
    }

    /// Removes a previously installed payload, if any.
    pub fn delete_existing_payload(&mut self) -> Result<()> {
        let dest = match self.ctx.dest() {
            Some(dest) => dest.to_path_buf(),
            None => self.ensure_mounted()?,
        };
        if payload::existing_liveos(&dest) {
            payload::delete_liveos(self.backend.supervisor(), &dest)?;
        }
        Ok(())
    }

    /// Mounts the target and records where.
    pub fn mount(&mut self) -> Result<PathBuf> {
        let dest = self.ensure_mounted()?;
        info!("Using {} as the installation target", dest.display());
        Ok(dest)
    }

    /// Restores the `syslinux` boot code if the current one is blank or
    /// foreign.
    pub fn reset_mbr(&mut self) -> Result<()> {
        let drive = self.drive()?;
        if self.backend.blank_master_boot_record(&drive) || !self.backend.mbr_matches_syslinux(&drive) {
            info!("Resetting Master Boot Record of {}", drive.whole_disk().display());
            self.backend.reset_master_boot_record(&drive)?;
        } else {
            debug!("Master Boot Record of {} is fine", drive.whole_disk().display());
        }
        Ok(())
    }

    /// Copies the payload from the image and measures how fast it went.
    pub fn extract_image(&mut self) -> Result<()> {
        let image = self.image()?;
        let dest = self.dest()?;
        info!("Extracting live image to the target device...");
        let start = Instant::now();
        self.backend.extract_image(&image, &dest)?;
        self.ctx.mb_per_sec = context::throughput(self.ctx.image_size, start.elapsed().as_secs_f64());
        if let Some(rate) = self.ctx.mb_per_sec {
            info!("Wrote to device at {rate:.0} MB/sec");
        }
        Ok(())
    }

    /// Rewrites the extracted boot configurations for the target.
    pub fn update_configs(&mut self) -> Result<()> {
        let dest = self.dest()?;
        let drive = self.drive()?;
        let rewrite = Rewrite {
            label: self.ctx.label.clone(),
            fstype: drive.fstype,
            overlay: self.ctx.overlay_bytes > 0,
            kernel_args: self.ctx.kernel_args.clone(),
        };
        bootcfg::update_configs(&dest, &rewrite)
    }

    /// Installs the bootloader; extraction must have run first.
    pub fn install_bootloader(&mut self) -> Result<()> {
        let dest = self.dest()?;
        if !dest.join(ISOLINUX_DIR).exists() {
            return Err(Error::Precondition(
                "extract_image must be run before install_bootloader".into(),
            ));
        }
        if self.options.xo {
            olpc::setup_olpc(&dest)?;
        }
        let drive = self.drive()?;
        info!("Installing bootloader...");
        self.backend.install_bootloader(&drive, &dest, &self.options)
    }

    /// Allocates the persistent overlay file, if one was requested.
    pub fn create_persistent_overlay(&mut self) -> Result<()> {
        if self.ctx.overlay_bytes == 0 {
            return Ok(());
        }
        let dest = self.dest()?;
        let drive = self.drive()?;
        let path = payload::overlay_path(&dest, &self.ctx.label, &drive.uuid);
        info!(
            "Creating {} MB persistent overlay...",
            self.ctx.overlay_bytes / (1024 * 1024)
        );
        fs::create_dir_all(payload::liveos_dir(&dest))
            .map_err(|e| Error::io(format!("creating {}", payload::liveos_dir(&dest).display()), e))?;
        payload::create_overlay(&path, self.ctx.overlay_bytes, &drive.fstype)
    }

    /// Sets the boot flag. Failures are logged only.
    pub fn bootable_partition(&mut self) {
        let drive = match self.drive() {
            Ok(drive) => drive,
            Err(e) => {
                error!("Unable to mark partition bootable: {e}");
                return;
            }
        };
        if let Err(e) = self.backend.bootable_partition(&drive) {
            error!("Unable to mark {} bootable: {e}", drive.device.display());
        }
    }

    /// Releases the mount and flushes write buffers.
    pub fn unmount_and_flush(&mut self) -> Result<()> {
        let drive = self.drive()?;
        self.backend.unmount_device(&drive.key)?;
        self.ctx.dest = None;
        self.backend.flush_buffers()
    }

    /// Writes the image over the whole disk the target lives on.
    pub fn write_raw_image(&mut self) -> Result<()> {
        let image = self.image()?;
        let drive = self.drive()?;
        if drive.mount.is_some() {
            self.backend.unmount_device(&drive.key)?;
        }
        warn!("Overwriting {} with {}", drive.whole_disk().display(), image.display());
        let start = Instant::now();
        self.backend.write_raw_image(&image, &drive)?;
        self.ctx.mb_per_sec = context::throughput(self.ctx.image_size, start.elapsed().as_secs_f64());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_space_boundaries() {
        assert!(check_space(800_000_000, 900_000_000).is_ok());
        assert!(check_space(900_000_000, 900_000_000).is_ok());
        match check_space(800_000_000, 700_000_000) {
            Err(Error::InsufficientSpace {
                required,
                available,
            }) => {
                assert_eq!(required, 800_000_000);
                assert_eq!(available, 700_000_000);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::SelectImage < Stage::VerifyImage);
        assert!(Stage::ExtractImage < Stage::UpdateBootConfigs);
        assert!(Stage::InstallBootloader < Stage::CreatePersistentOverlay);
        assert_eq!(Stage::Mount.to_string(), "Mounting device");
    }
}

//! The core, UI-agnostic library for the `liveusb` creator.
//!
//! `liveusb-core` turns a live ISO image into a bootable removable drive. It is
//! meant to be driven by any front-end, whether a command-line interface (like
//! `liveusb`) or a graphical one. It handles drive discovery and hotplug,
//! supervision of the external tools that do the platform work, checksum
//! verification, and the ordered installation pipeline.
//!
//! The library is structured into several key modules:
//! - [`device`] and [`inventory`]: the drive record and the shared set of known
//!   drives, updated by hotplug events.
//! - [`platform`]: the [`platform::DeviceBackend`] trait and its Linux and
//!   Windows implementations.
//! - [`process`]: the [`process::Supervisor`] that runs, logs and cancels
//!   external tools.
//! - [`checksum`] and [`release`]: image, device and payload digests, and the
//!   catalog of published checksums.
//! - [`pipeline`]: the [`pipeline::Installer`] state machine, with [`bootcfg`],
//!   [`payload`], [`olpc`] and [`staging`] doing the file-level work.
//!
//! Long-running operations report progress through callbacks so that the
//! caller can display it however it chooses.
//!
//! ## Example: Installing an Image
//!
//! ```rust,no_run
//! use liveusb_core::{platform, InstallOptions, Installer, Stage};
//! use std::path::Path;
//!
//! fn main() -> liveusb_core::Result<()> {
//!     let backend = platform::native(None)?;
//!     let _events = backend.detect_removable_drives()?;
//!     let drives = backend.inventory().drives();
//!     let Some(target) = drives.first() else {
//!         println!("No removable drives found.");
//!         return Ok(());
//!     };
//!
//!     let options = InstallOptions {
//!         overlay_mib: 512,
//!         ..Default::default()
//!     };
//!     let mut installer = Installer::new(backend.as_ref(), options)?;
//!     installer.run(
//!         Path::new("Fedora-Live-Workstation-x86_64-23-10.iso"),
//!         &target.key,
//!         &mut |stage: Stage| println!("{stage}..."),
//!     )?;
//!
//!     println!("Complete!");
//!     Ok(())
//! }
//! ```

pub mod bootcfg;
pub mod checksum;
pub mod context;
pub mod device;
pub mod error;
pub mod inventory;
pub mod olpc;
pub mod options;
pub mod payload;
pub mod pipeline;
pub mod platform;
pub mod policy;
pub mod process;
pub mod release;
pub mod staging;

pub use checksum::HashAlgorithm;
pub use device::{Drive, DriveEvent};
pub use error::{Error, Result};
pub use options::InstallOptions;
pub use pipeline::{Installer, Stage};

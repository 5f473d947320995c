//! Layout of a live payload on the target filesystem, and the file
//! operations that create, move and delete it.
use crate::error::{Error, Result};
use crate::policy::is_fat;
use crate::process::{ExitPolicy, Supervisor};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const LIVEOS_DIR: &str = "LiveOS";
pub const ISOLINUX_DIR: &str = "isolinux";
pub const SYSLINUX_DIR: &str = "syslinux";
pub const EFI_DIR: &str = "EFI";
const LDLINUX: &str = "ldlinux.sys";

/// `dest/LiveOS`.
pub fn liveos_dir(dest: &Path) -> PathBuf {
    dest.join(LIVEOS_DIR)
}

pub fn existing_liveos(dest: &Path) -> bool {
    liveos_dir(dest).exists()
}

/// Whether the image's `EFI` tree should be copied to `dest`. An `EFI`
/// directory already on the target is left alone, customisations included.
pub fn needs_efi_copy(src: &Path, dest: &Path) -> bool {
    src.join(EFI_DIR).is_dir() && !dest.join(EFI_DIR).exists()
}

/// The overlay file for a given volume label and UUID.
pub fn overlay_path(dest: &Path, label: &str, uuid: &str) -> PathBuf {
    liveos_dir(dest).join(format!("overlay-{label}-{uuid}"))
}

/// Removes stale `ldlinux.sys` files left by an earlier install, so that
/// `syslinux` does not prompt about overwriting them.
pub fn delete_ldlinux(supervisor: &Supervisor, dest: &Path) -> Result<()> {
    for ldlinux in [dest.join(SYSLINUX_DIR).join(LDLINUX), dest.join(LDLINUX)] {
        debug!("Looking for {}", ldlinux.display());
        if !ldlinux.is_file() {
            continue;
        }
        debug!("Removing {}", ldlinux.display());
        clear_immutable(supervisor, &ldlinux)?;
        make_writable(&ldlinux);
        fs::remove_file(&ldlinux)
            .map_err(|e| Error::io(format!("removing {}", ldlinux.display()), e))?;
    }
    Ok(())
}

/// `syslinux` marks `ldlinux.sys` immutable on ext filesystems.
#[cfg(unix)]
fn clear_immutable(supervisor: &Supervisor, path: &Path) -> Result<()> {
    match supervisor.run("chattr", [OsStr::new("-i"), path.as_os_str()], ExitPolicy::Passive) {
        Ok(_) => Ok(()),
        Err(Error::ToolNotFound { .. }) => {
            debug!("chattr is not available; not clearing attributes");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn clear_immutable(_supervisor: &Supervisor, _path: &Path) -> Result<()> {
    Ok(())
}

fn make_writable(path: &Path) {
    let result = fs::metadata(path).and_then(|meta| {
        let mut perms = meta.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(perms.mode() | 0o700);
        }
        #[cfg(not(unix))]
        perms.set_readonly(false);
        fs::set_permissions(path, perms)
    });
    if let Err(e) = result {
        debug!("Unable to make {} writable: {e}", path.display());
    }
}

/// Clears read-only attributes below `path`; some filesystems refuse to
/// delete read-only files otherwise.
fn make_tree_writable(path: &Path) {
    for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        make_writable(entry.path());
    }
}

/// Deletes a previously installed live payload and bootloader directories.
pub fn delete_liveos(supervisor: &Supervisor, dest: &Path) -> Result<()> {
    info!("Removing existing Live OS");
    delete_ldlinux(supervisor, dest)?;
    for path in [
        liveos_dir(dest),
        dest.join(SYSLINUX_DIR),
        dest.join(ISOLINUX_DIR),
    ] {
        if !path.exists() {
            continue;
        }
        debug!("Deleting {}", path.display());
        make_tree_writable(&path);
        fs::remove_dir_all(&path).map_err(|e| {
            Error::io(format!("Unable to remove previous LiveOS {}", path.display()), e)
        })?;
    }
    Ok(())
}

/// Replaces `dest/syslinux` with the extracted `dest/isolinux` and drops the
/// original `isolinux.cfg`, leaving the rewritten `syslinux.cfg` in place.
pub fn move_isolinux_to_syslinux(dest: &Path) -> Result<PathBuf> {
    let isolinux = dest.join(ISOLINUX_DIR);
    let syslinux = dest.join(SYSLINUX_DIR);
    if syslinux.exists() {
        make_tree_writable(&syslinux);
        fs::remove_dir_all(&syslinux)
            .map_err(|e| Error::io(format!("removing {}", syslinux.display()), e))?;
    }
    fs::rename(&isolinux, &syslinux).map_err(|e| {
        Error::io(
            format!("moving {} to {}", isolinux.display(), syslinux.display()),
            e,
        )
    })?;
    let stale = syslinux.join("isolinux.cfg");
    if stale.exists() {
        fs::remove_file(&stale).map_err(|e| Error::io(format!("removing {}", stale.display()), e))?;
    }
    Ok(syslinux)
}

/// Allocates the persistent overlay file.
///
/// FAT cannot represent sparse files, so there the overlay is written out in
/// full; elsewhere the file is only extended to its size.
pub fn create_overlay(path: &Path, bytes: u64, fstype: &str) -> Result<()> {
    let wrap = |e| Error::io(format!("creating overlay {}", path.display()), e);
    let mut file = File::create(path).map_err(wrap)?;
    if is_fat(fstype) {
        let chunk = vec![0u8; 1024 * 1024];
        let mut written: u64 = 0;
        while written < bytes {
            let n = std::cmp::min(chunk.len() as u64, bytes - written) as usize;
            file.write_all(&chunk[..n]).map_err(wrap)?;
            written += n as u64;
        }
    } else {
        file.set_len(bytes).map_err(wrap)?;
    }
    file.sync_all().map_err(wrap)?;
    Ok(())
}

/// Copies each `(source, destination)` pair, but only where the destination
/// already exists. Failures are logged and skipped.
pub fn copy_over_existing(copies: &[(PathBuf, PathBuf)]) {
    for (from, to) in copies {
        if !to.exists() {
            continue;
        }
        if let Err(e) = fs::copy(from, to) {
            warn!(
                "Unable to copy {} to {}: {e}",
                from.display(),
                to.display()
            );
        }
    }
}

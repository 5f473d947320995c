//! Rewriting of the image's boot loader configuration for the USB target.
//!
//! The image boots from a CD label; the stick boots from its own volume
//! label, may carry a persistent overlay, and uses `syslinux` rather than
//! `isolinux`. The rewrite is applied line by line to the legacy
//! `isolinux.cfg` and to the EFI `grub.cfg`.
use crate::error::{Error, Result};
use crate::payload::{self, ISOLINUX_DIR};
use regex::{NoExpand, Regex};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// Kernel parameters that mark the live boot entry, old and new dracut.
const LIVE_MARKERS: [(&str, &str); 2] = [
    ("rd.live.image", "rd.live.overlay"),
    ("liveimg", "overlay"),
];

/// What to substitute into each boot configuration.
#[derive(Clone, Debug)]
pub struct Rewrite {
    pub label: String,
    pub fstype: String,
    /// Whether a persistent overlay will be created.
    pub overlay: bool,
    pub kernel_args: Vec<String>,
}

fn label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"LABEL=[^ :]*").expect("valid regex"))
}

fn rootfstype_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"rootfstype=[^ ]*").expect("valid regex"))
}

/// Rewrites a single configuration line.
pub fn rewrite_line(line: &str, rewrite: &Rewrite) -> String {
    let usb_label = format!("LABEL={}", rewrite.label);
    let mut line = line.to_string();

    if line.contains("LABEL") {
        line = label_re().replace_all(&line, NoExpand(&usb_label)).into_owned();
        let fstype = format!("rootfstype={}", rewrite.fstype);
        line = rootfstype_re().replace_all(&line, NoExpand(&fstype)).into_owned();
    }

    if line.contains("isolinux") {
        line = line.replace("isolinux", "syslinux");
    }

    // Only the first marker present is handled, matching either the new
    // (`rd.live.image`) or the legacy (`liveimg`) live entry.
    if let Some((marker, overlay_key)) = LIVE_MARKERS.iter().find(|(m, _)| line.contains(m)) {
        let mut inserted = Vec::new();
        if rewrite.overlay {
            let overlay = format!("{overlay_key}={usb_label}");
            if !line.contains(&overlay) {
                inserted.push(overlay);
            }
            line = line.replace(" ro ", " rw ");
        }
        for arg in &rewrite.kernel_args {
            if !line.split_whitespace().any(|word| word == arg) {
                inserted.push(arg.clone());
            }
        }
        if !inserted.is_empty() {
            line = line.replace(marker, &format!("{marker} {}", inserted.join(" ")));
        }
    }

    line
}

/// Rewrites a whole configuration file's text, preserving line endings.
pub fn rewrite_config(text: &str, rewrite: &Rewrite) -> String {
    text.split_inclusive('\n')
        .map(|line| rewrite_line(line, rewrite))
        .collect()
}

fn rewrite_file(infile: &Path, outfile: &Path, rewrite: &Rewrite) -> Result<()> {
    let text = fs::read_to_string(infile)
        .map_err(|e| Error::io(format!("reading {}", infile.display()), e))?;
    fs::write(outfile, rewrite_config(&text, rewrite))
        .map_err(|e| Error::io(format!("writing {}", outfile.display()), e))?;
    debug!("Rewrote {} to {}", infile.display(), outfile.display());
    Ok(())
}

/// The legacy and EFI configurations the rewrite reads and writes, relative
/// to the mount point.
pub struct ConfigPaths {
    pub isolinux_cfg: PathBuf,
    pub syslinux_cfg: PathBuf,
    pub grub_cfg: PathBuf,
    pub boot_conf: PathBuf,
    pub bootx64_conf: PathBuf,
    pub bootia32_conf: PathBuf,
}

impl ConfigPaths {
    pub fn new(dest: &Path) -> Self {
        let efi_boot = dest.join("EFI").join("BOOT");
        Self {
            isolinux_cfg: dest.join(ISOLINUX_DIR).join("isolinux.cfg"),
            syslinux_cfg: dest.join(ISOLINUX_DIR).join("syslinux.cfg"),
            grub_cfg: efi_boot.join("grub.cfg"),
            boot_conf: efi_boot.join("boot.conf"),
            bootx64_conf: efi_boot.join("bootx64.conf"),
            bootia32_conf: efi_boot.join("bootia32.conf"),
        }
    }
}

/// Generates `syslinux.cfg` and the EFI configs under `dest`.
///
/// The EFI variants are refreshed from the rewritten `boot.conf`, but only
/// those that existed before the rewrite: no new EFI entry points are added.
pub fn update_configs(dest: &Path, rewrite: &Rewrite) -> Result<()> {
    let paths = ConfigPaths::new(dest);
    let copies: Vec<(PathBuf, PathBuf)> = [
        &paths.grub_cfg,
        &paths.bootx64_conf,
        &paths.bootia32_conf,
    ]
    .into_iter()
    .filter(|target| target.exists())
    .map(|target| (paths.boot_conf.clone(), target.clone()))
    .collect();

    for (infile, outfile) in [
        (&paths.isolinux_cfg, &paths.syslinux_cfg),
        (&paths.grub_cfg, &paths.boot_conf),
    ] {
        if infile.exists() {
            rewrite_file(infile, outfile, rewrite)?;
        }
    }

    if paths.boot_conf.exists() {
        payload::copy_over_existing(&copies);
    }
    Ok(())
}

/// Kernel arguments of the first `append` line, without `initrd=` entries.
pub fn kernel_args_from_config(text: &str) -> Vec<String> {
    text.lines()
        .find(|line| line.contains("append"))
        .map(|line| {
            line.split_whitespace()
                .skip(1)
                .filter(|arg| !arg.starts_with("initrd"))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ISOLINUX_CFG: &str = "\
default vesamenu.c32
menu background splash.png
label linux0
  menu label ^Start Fedora-Live
  kernel vmlinuz0
  append initrd=initrd0.img root=live:CDLABEL=Fedora-Live-WS-x86_64-23-10 rootfstype=auto ro rd.live.image quiet  rhgb rd.luks=0 rd.md=0 rd.dm=0
label check0
  menu label Test this ^media & start Fedora-Live
  kernel /isolinux/vmlinuz0
";

    fn rewrite(overlay: bool, args: &[&str]) -> Rewrite {
        Rewrite {
            label: "LIVE".into(),
            fstype: "vfat".into(),
            overlay,
            kernel_args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn label_and_fstype_are_substituted() {
        let out = rewrite_config(ISOLINUX_CFG, &rewrite(false, &[]));
        assert!(out.contains("root=live:CDLABEL=LIVE rootfstype=vfat ro rd.live.image quiet"));
        assert!(out.contains("kernel /syslinux/vmlinuz0"));
        assert!(!out.contains("isolinux"));
    }

    #[test]
    fn overlay_makes_root_writable() {
        let out = rewrite_config(ISOLINUX_CFG, &rewrite(true, &[]));
        assert!(out.contains("rootfstype=vfat rw rd.live.image rd.live.overlay=LABEL=LIVE quiet"));
    }

    #[test]
    fn kernel_args_follow_live_marker() {
        let out = rewrite_config(ISOLINUX_CFG, &rewrite(false, &["nomodeset", "debug"]));
        assert!(out.contains("rd.live.image nomodeset debug quiet"));
    }

    #[test]
    fn legacy_liveimg_marker() {
        let line = "  append initrd=initrd0.img root=CDLABEL=F10 rootfstype=iso9660 ro liveimg quiet\n";
        let out = rewrite_line(line, &rewrite(true, &["selinux=0"]));
        assert_eq!(
            out,
            "  append initrd=initrd0.img root=CDLABEL=LIVE rootfstype=vfat rw liveimg overlay=LABEL=LIVE selinux=0 quiet\n"
        );
    }

    #[test]
    fn rewrite_is_idempotent() {
        let r = rewrite(true, &["nomodeset"]);
        let once = rewrite_config(ISOLINUX_CFG, &r);
        let twice = rewrite_config(&once, &r);
        assert_eq!(once, twice);

        for fstype in ["vfat", "msdos", "ext2", "ext3", "ext4"] {
            let r = Rewrite {
                fstype: fstype.into(),
                ..rewrite(false, &[])
            };
            let once = rewrite_config(ISOLINUX_CFG, &r);
            assert_eq!(rewrite_config(&once, &r), once);
        }
    }

    #[test]
    fn dollar_in_label_is_literal() {
        let r = Rewrite {
            label: "A$B".into(),
            ..rewrite(true, &[])
        };
        let out = rewrite_line(
            "  append root=live:CDLABEL=Fedora rootfstype=auto ro rd.live.image quiet",
            &r,
        );
        assert_eq!(
            out,
            "  append root=live:CDLABEL=A$B rootfstype=vfat rw rd.live.image rd.live.overlay=LABEL=A$B quiet"
        );

        let r = Rewrite {
            label: "${0}x".into(),
            ..rewrite(false, &[])
        };
        let out = rewrite_line("root=live:LABEL=Old rootfstype=auto", &r);
        assert_eq!(out, "root=live:LABEL=${0}x rootfstype=vfat");
    }

    #[test]
    fn kernel_args_skip_initrd() {
        let args = kernel_args_from_config(ISOLINUX_CFG);
        assert_eq!(args.first().map(String::as_str), Some("root=live:CDLABEL=Fedora-Live-WS-x86_64-23-10"));
        assert!(!args.iter().any(|a| a.starts_with("initrd")));
        assert!(kernel_args_from_config("default linux\n").is_empty());
    }

    #[test]
    fn efi_configs_only_refreshed_where_present() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path();
        let paths = ConfigPaths::new(dest);
        fs::create_dir_all(paths.isolinux_cfg.parent().unwrap()).unwrap();
        fs::create_dir_all(paths.grub_cfg.parent().unwrap()).unwrap();
        fs::write(&paths.isolinux_cfg, ISOLINUX_CFG).unwrap();
        fs::write(
            &paths.grub_cfg,
            "linuxefi /isolinux/vmlinuz0 root=live:LABEL=Fedora-Live rd.live.image quiet\n",
        )
        .unwrap();
        fs::write(&paths.bootx64_conf, "stale\n").unwrap();

        update_configs(dest, &rewrite(false, &[])).unwrap();

        let syslinux = fs::read_to_string(&paths.syslinux_cfg).unwrap();
        assert!(syslinux.contains("CDLABEL=LIVE"));
        // The original is left for the bootloader step to discard.
        assert_eq!(fs::read_to_string(&paths.isolinux_cfg).unwrap(), ISOLINUX_CFG);

        let expected = "linuxefi /syslinux/vmlinuz0 root=live:LABEL=LIVE rd.live.image quiet\n";
        assert_eq!(fs::read_to_string(&paths.boot_conf).unwrap(), expected);
        assert_eq!(fs::read_to_string(&paths.grub_cfg).unwrap(), expected);
        assert_eq!(fs::read_to_string(&paths.bootx64_conf).unwrap(), expected);
        assert!(!paths.bootia32_conf.exists());
    }

    #[test]
    fn missing_configs_are_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        update_configs(dir.path(), &rewrite(true, &[])).unwrap();
        assert!(!ConfigPaths::new(dir.path()).syslinux_cfg.exists());
    }
}

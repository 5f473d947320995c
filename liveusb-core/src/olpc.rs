//! Open Firmware boot script that lets an OLPC XO boot the drive.
use crate::bootcfg::{self, ConfigPaths};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Boots the kernel and initrd from `syslinux/` on whichever of the USB or
/// SD slot the XO started from. `%s` takes the kernel command line.
const OFW_CONFIG: &str = r#"\ Boot script for USB boot
hex  rom-pa fffc7 + 4 $number drop  h# 2e19 < [if]
  patch 2drop erase claim-params
  : high-ramdisk  ( -- )
     cv-load-ramdisk
     h# 22c +lp l@ 1+   memory-limit  umin  /ramdisk - ffff.f000 and ( new-ramdisk-adr )
     ramdisk-adr over  /ramdisk move                    ( new-ramdisk-adr )
     to ramdisk-adr
  ;
  ' high-ramdisk to load-ramdisk
[then]

: set-bootpath-dev  ( -- )
   " /chosen" find-package  if                       ( phandle )
      " bootpath" rot  get-package-property  0=  if  ( propval$ )
         get-encoded-string                          ( bootpath$ )
         [char] \ left-parse-string  2nip            ( dn$ )
         dn-buf place                                ( )
      then
   then

   " /sd"  dn-buf  count  sindex  0>=   if
          " sd:"
   else
          " u:"
   then
   " BOOTPATHDEV" $set-macro
;

set-bootpath-dev
" %s" to boot-file
" ${BOOTPATHDEV}\syslinux\initrd0.img" expand$ to ramdisk
" ${BOOTPATHDEV}\syslinux\vmlinuz0" expand$ to boot-device
unfreeze
boot
"#;

/// Renders the boot script for the given kernel arguments.
pub fn render(kernel_args: &[String]) -> String {
    OFW_CONFIG.replace("%s", &kernel_args.join(" "))
}

/// Writes `boot/olpc.fth` under `dest`, taking the kernel arguments from the
/// rewritten `syslinux.cfg`.
pub fn setup_olpc(dest: &Path) -> Result<PathBuf> {
    info!("Setting up OLPC boot file...");
    let cfg = ConfigPaths::new(dest).syslinux_cfg;
    let text = fs::read_to_string(&cfg)
        .map_err(|e| Error::io(format!("reading {}", cfg.display()), e))?;
    let args = bootcfg::kernel_args_from_config(&text);

    let boot = dest.join("boot");
    fs::create_dir_all(&boot).map_err(|e| Error::io(format!("creating {}", boot.display()), e))?;
    let path = boot.join("olpc.fth");
    fs::write(&path, render(&args)).map_err(|e| Error::io(format!("writing {}", path.display()), e))?;
    debug!("Wrote {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_boot_script_with_kernel_args() {
        let dir = tempfile::tempdir().unwrap();
        let isolinux = dir.path().join("isolinux");
        fs::create_dir_all(&isolinux).unwrap();
        fs::write(
            isolinux.join("syslinux.cfg"),
            "label linux0\n  append initrd=initrd0.img root=live:CDLABEL=LIVE rd.live.image quiet\n",
        )
        .unwrap();

        let path = setup_olpc(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("boot/olpc.fth"));
        let script = fs::read_to_string(path).unwrap();
        assert!(script.contains(r#"" root=live:CDLABEL=LIVE rd.live.image quiet" to boot-file"#));
        assert!(!script.contains("%s"));
    }

    #[test]
    fn requires_rewritten_config() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(setup_olpc(dir.path()), Err(Error::Io { .. })));
    }
}

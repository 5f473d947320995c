//! Linux backend: `lsblk` enumeration, `udevadm` hotplug, `udisksctl`
//! mounts and the syslinux/extlinux tool chain.
use crate::device::{Drive, DriveEvent};
use crate::error::{Error, Result};
use crate::inventory::Inventory;
use crate::options::InstallOptions;
use crate::payload::{self, EFI_DIR, ISOLINUX_DIR, LIVEOS_DIR, SYSLINUX_DIR};
use crate::platform::{DeviceBackend, Proxies, read_boot_signature};
use crate::policy::{self, EnumerationPolicy, Filesystems, Probe};
use crate::process::{self, ExitPolicy, Supervisor};
use nix::ioctl_read;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::ffi::{OsStr, OsString};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

ioctl_read!(blkgetsize64, 0x12, 114, u64);

const LSBLK_COLUMNS: &str =
    "NAME,KNAME,PKNAME,TYPE,FSTYPE,FSVER,LABEL,UUID,MOUNTPOINTS,SIZE,RM,HOTPLUG,TRAN,VENDOR,MODEL";

const MBR_BIN_PATHS: [&str; 4] = [
    "/usr/lib/syslinux/mbr.bin",
    "/usr/share/syslinux/mbr.bin",
    "/usr/lib/syslinux/bios/mbr.bin",
    "/usr/lib/syslinux/mbr/mbr.bin",
];

const SYSLINUX_DATA_DIRS: [&str; 2] = ["/usr/share/syslinux", "/usr/lib/syslinux"];

/// Menu modules, most preferred first. Only the first one found is copied:
/// syslinux does not keep a stable com32 ABI, so the stick must carry the
/// module matching the installer.
const COM32_MODULES: [&str; 2] = ["vesamenu.c32", "menu.c32"];

#[derive(Debug, Deserialize)]
struct Lsblk {
    #[serde(default)]
    blockdevices: Vec<BlockDevice>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct BlockDevice {
    name: String,
    #[serde(default)]
    kname: Option<String>,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    fsver: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    mountpoints: Vec<Option<String>>,
    #[serde(default, deserialize_with = "flexible_u64")]
    size: u64,
    #[serde(default, deserialize_with = "flexible_bool")]
    rm: bool,
    #[serde(default, deserialize_with = "flexible_bool")]
    hotplug: bool,
    #[serde(default)]
    tran: Option<String>,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    children: Vec<BlockDevice>,
}

// Older util-linux prints booleans and sizes as strings.
fn flexible_bool<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_u64() == Some(1),
        Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

fn flexible_u64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

impl BlockDevice {
    fn mounts(&self) -> Vec<PathBuf> {
        self.mountpoints.iter().flatten().map(PathBuf::from).collect()
    }

    fn key(&self) -> String {
        let name = self.kname.as_deref().unwrap_or(&self.name);
        Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string())
    }

    /// True if this device or anything stacked on it holds the root filesystem.
    fn holds_root(&self, root: Option<&Path>) -> bool {
        self.mounts().iter().any(|m| m == Path::new("/"))
            || root.is_some_and(|r| Path::new(&self.name) == r)
            || self.children.iter().any(|c| c.holds_root(root))
    }
}

fn friendly_name(disk: &BlockDevice) -> String {
    [disk.vendor.as_deref(), disk.model.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Turns one `lsblk` node into a probe for the policy and a candidate drive.
fn candidate(dev: &BlockDevice, disk: &BlockDevice, on_system_disk: bool) -> (Probe, Drive) {
    let is_partition = !std::ptr::eq(dev, disk);
    let fstype = dev.fstype.clone().unwrap_or_default();
    let mounts = dev.mounts();
    let probe = Probe {
        device: PathBuf::from(&dev.name),
        removable: disk.rm || disk.hotplug,
        optical: disk.kind == "rom",
        bus: disk.tran.clone().filter(|t| !t.is_empty()),
        on_system_disk,
        mounts: mounts.clone(),
        size: dev.size,
        fstype: fstype.clone(),
    };
    let drive = Drive {
        key: dev.key(),
        device: PathBuf::from(&dev.name),
        parent: is_partition.then(|| PathBuf::from(&disk.name)),
        fstype,
        fsversion: dev.fsver.clone().unwrap_or_default(),
        label: dev.label.clone().unwrap_or_default(),
        uuid: dev.uuid.clone().unwrap_or_default(),
        mount: mounts.into_iter().next(),
        size: dev.size,
        disk_size: disk.size,
        free: None,
        friendly_name: friendly_name(disk),
    };
    (probe, drive)
}

/// Flattens the `lsblk` tree into partitions, plus whole disks that carry a
/// filesystem directly.
fn candidates(devices: &[BlockDevice], root: Option<&Path>) -> Vec<(Probe, Drive)> {
    let mut out = Vec::new();
    for disk in devices {
        let on_system_disk = disk.holds_root(root);
        if disk.fstype.is_some() {
            out.push(candidate(disk, disk, on_system_disk));
        }
        for part in disk.children.iter().filter(|c| c.kind == "part") {
            out.push(candidate(part, disk, on_system_disk));
        }
    }
    out
}

/// The device the root filesystem is mounted from.
fn root_device() -> Option<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| PathBuf::from("/dev/").join(disk.name()))
}

fn statvfs_free(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(|e| Error::FreeSpaceUnavailable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Where the hotplug thread's tool output is logged.
fn hotplug_log_path() -> PathBuf {
    process::default_log_path().with_file_name("liveusb-creator-hotplug.log")
}

/// Enumerates block devices into the inventory. Shared with the hotplug
/// thread.
#[derive(Clone)]
struct Scanner {
    supervisor: Arc<Supervisor>,
    inventory: Arc<Inventory>,
    policy: EnumerationPolicy,
}

impl Scanner {
    /// A copy that runs its tools under a separate supervisor and log, so
    /// hotplug probes neither land in an install's failure log nor stop
    /// working once the install is cancelled.
    fn detached(&self, log_path: PathBuf) -> Self {
        Self {
            supervisor: Arc::new(Supervisor::with_log_path(log_path)),
            ..self.clone()
        }
    }

    fn probe(&self) -> Result<Vec<(Probe, Drive)>> {
        let output = self.supervisor.run(
            "lsblk",
            ["--json", "--bytes", "--paths", "--output", LSBLK_COLUMNS],
            ExitPolicy::Strict,
        )?;
        let lsblk: Lsblk = serde_json::from_str(&output.stdout).map_err(|e| {
            Error::Precondition(format!("Unable to parse lsblk output: {e}"))
        })?;
        Ok(candidates(&lsblk.blockdevices, root_device().as_deref()))
    }

    fn admit(&self, probe: &Probe, mut drive: Drive) -> Option<Drive> {
        match self.policy.admit(probe) {
            Ok(()) => {
                drive.free = drive.mount.as_deref().and_then(|m| statvfs_free(m).ok());
                Some(drive)
            }
            Err(skip) => {
                debug!("Skipping {}: {skip}", probe.device.display());
                None
            }
        }
    }

    fn scan(&self) -> Result<()> {
        for (probe, drive) in self.probe()? {
            if let Some(drive) = self.admit(&probe, drive) {
                info!("Found {}", drive.device.display());
                self.inventory.insert(drive);
            }
        }
        Ok(())
    }

    /// Re-reads one device after a change; drops it if it no longer qualifies.
    fn rescan(&self, key: &str) -> Result<()> {
        let found = self
            .probe()?
            .into_iter()
            .find(|(_, drive)| drive.key == key)
            .and_then(|(probe, drive)| self.admit(&probe, drive));
        match found {
            Some(drive) => self.inventory.insert(drive),
            None => {
                self.inventory.remove(key);
            }
        }
        Ok(())
    }
}

/// A block uevent reported by `udevadm monitor`.
#[derive(Debug, PartialEq, Eq)]
struct UdevEvent {
    action: String,
    name: String,
}

/// Parses `UDEV  [1234.5678] add  /devices/.../block/sdb/sdb1 (block)`.
fn parse_udev_line(line: &str) -> Option<UdevEvent> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 4 || tokens[0] != "UDEV" {
        return None;
    }
    let name = tokens[3].rsplit('/').next()?.to_string();
    Some(UdevEvent {
        action: tokens[2].to_string(),
        name,
    })
}

/// Extracts the mount point from `Mounted /dev/sdb1 at /run/media/u/LIVE.`
fn parse_udisksctl_mount(stdout: &str) -> Option<PathBuf> {
    let (_, at) = stdout.trim().split_once(" at ")?;
    let path = at.trim().trim_end_matches('.');
    (!path.is_empty()).then(|| PathBuf::from(path))
}

/// Extracts the mount point from udisks' `AlreadyMounted` error, which
/// quotes it as `` `/run/media/u/LIVE' ``.
fn parse_already_mounted(stderr: &str) -> Option<PathBuf> {
    if !stderr.contains("AlreadyMounted") {
        return None;
    }
    let start = stderr.rfind('`')? + 1;
    let end = start + stderr[start..].find('\'')?;
    Some(PathBuf::from(&stderr[start..end]))
}

/// Major version from `extlinux --version` output.
fn parse_extlinux_version(text: &str) -> Option<u32> {
    text.split_whitespace()
        .find(|word| word.starts_with(|c: char| c.is_ascii_digit()))?
        .split('.')
        .next()?
        .parse()
        .ok()
}

fn extlinux_version(supervisor: &Supervisor) -> Option<u32> {
    if which::which("extlinux").is_err() {
        debug!("extlinux not found; ext filesystems are not supported");
        return None;
    }
    let output = supervisor
        .run("extlinux", ["--version"], ExitPolicy::Passive)
        .ok()?;
    let version = parse_extlinux_version(&format!("{}\n{}", output.stderr, output.stdout));
    debug!("extlinux major version {version:?}");
    version
}

/// Reads KDE's manual proxy settings (`ProxyType=1`).
fn parse_kioslaverc(text: &str) -> Proxies {
    let mut in_section = false;
    let mut manual = false;
    let mut found = Proxies::new();
    for line in text.lines().map(str::trim) {
        if line.starts_with('[') {
            in_section = line == "[Proxy Settings]";
            continue;
        }
        if !in_section {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "ProxyType" => manual = value == "1",
            "httpProxy" if !value.is_empty() => {
                found.insert("http".into(), value.to_string());
            }
            "ftpProxy" if !value.is_empty() => {
                found.insert("ftp".into(), value.to_string());
            }
            _ => {}
        }
    }
    if manual { found } else { Proxies::new() }
}

/// The partition number from a device node such as `/dev/sdb1` or
/// `/dev/mmcblk0p2`.
fn partition_number(node: &str) -> Option<u32> {
    let digits: String = node
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

#[derive(Debug, Deserialize)]
struct Sfdisk {
    partitiontable: PartitionTable,
}

#[derive(Debug, Deserialize)]
struct PartitionTable {
    #[serde(default)]
    label: String,
    #[serde(default)]
    partitions: Vec<SfdiskPartition>,
}

#[derive(Debug, Deserialize)]
struct SfdiskPartition {
    node: String,
    #[serde(default)]
    bootable: bool,
}

/// A read-only loop mount of an image, released on drop.
struct LoopMount<'a> {
    supervisor: &'a Supervisor,
    dir: TempDir,
}

impl<'a> LoopMount<'a> {
    fn new(supervisor: &'a Supervisor, image: &Path) -> Result<Self> {
        let dir = tempfile::tempdir().map_err(|e| Error::io("creating mount point", e))?;
        let mut args = vec![OsString::from("-o"), OsString::from("loop,ro")];
        args.push(image.as_os_str().to_owned());
        args.push(dir.path().as_os_str().to_owned());
        supervisor.run("mount", &args, ExitPolicy::Strict)?;
        Ok(Self { supervisor, dir })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for LoopMount<'_> {
    fn drop(&mut self) {
        // The temp dir is removed after this, once it is empty again.
        if let Err(e) = self
            .supervisor
            .run("umount", [self.dir.path()], ExitPolicy::Passive)
        {
            warn!("Unable to unmount {}: {e}", self.dir.path().display());
        }
    }
}

/// Linux implementation of [`DeviceBackend`].
pub struct LinuxBackend {
    scanner: Scanner,
    accepted: Filesystems,
    monitor: Mutex<Option<Child>>,
}

impl LinuxBackend {
    /// Probes the installed bootloader tools and sets up enumeration.
    pub fn new(force: Option<PathBuf>) -> Result<Self> {
        let supervisor = Arc::new(Supervisor::new());
        let accepted = Filesystems::for_extlinux(extlinux_version(&supervisor));
        debug!(
            "Accepted filesystems: {}",
            accepted.iter().collect::<Vec<_>>().join(", ")
        );
        Ok(Self {
            scanner: Scanner {
                supervisor,
                inventory: Arc::new(Inventory::new()),
                policy: EnumerationPolicy::new(accepted.clone(), force),
            },
            accepted,
            monitor: Mutex::new(None),
        })
    }

    fn drive(&self, key: &str) -> Result<Drive> {
        self.scanner
            .inventory
            .get(key)
            .ok_or_else(|| Error::DeviceNotFound(key.to_string()))
    }

    fn run<I, S>(&self, program: &str, args: I) -> Result<crate::process::Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.scanner.supervisor.run(program, args, ExitPolicy::Strict)
    }

    fn start_monitor(&self) -> Result<()> {
        let mut monitor = self
            .monitor
            .lock()
            .map_err(|_| Error::Precondition("hotplug monitor state poisoned".into()))?;
        if monitor.is_some() {
            return Ok(());
        }

        let mut child = Command::new("udevadm")
            .args(["monitor", "--udev", "--subsystem-match=block"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| Error::ToolNotFound {
                program: "udevadm".into(),
                source,
            })?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            return Err(Error::Precondition("udevadm produced no output stream".into()));
        };

        let scanner = self.scanner.detached(hotplug_log_path());
        thread::Builder::new()
            .name("udev-monitor".into())
            .spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                    let Some(event) = parse_udev_line(&line) else {
                        continue;
                    };
                    debug!("udev {} {}", event.action, event.name);
                    match event.action.as_str() {
                        "add" | "change" => {
                            if let Err(e) = scanner.rescan(&event.name) {
                                warn!("Unable to probe {}: {e}", event.name);
                            }
                        }
                        "remove" => {
                            if scanner.inventory.remove(&event.name).is_some() {
                                info!("{} removed", event.name);
                            }
                        }
                        _ => {}
                    }
                }
                debug!("udev monitor exited");
            })
            .map_err(|e| Error::io("starting hotplug monitor", e))?;

        *monitor = Some(child);
        Ok(())
    }

    fn mbr_bin() -> Option<PathBuf> {
        MBR_BIN_PATHS.iter().map(PathBuf::from).find(|p| p.is_file())
    }

    fn copy_com32_module(syslinux: &Path) {
        for module in COM32_MODULES {
            let Some(source) = SYSLINUX_DATA_DIRS
                .iter()
                .map(|dir| Path::new(dir).join(module))
                .find(|p| p.is_file())
            else {
                continue;
            };
            debug!("Copying {} on to stick", source.display());
            if let Err(e) = fs::copy(&source, syslinux.join(module)) {
                warn!("Unable to copy {}: {e}", source.display());
            }
            return;
        }
    }
}

impl Drop for LinuxBackend {
    fn drop(&mut self) {
        if let Ok(mut monitor) = self.monitor.lock() {
            if let Some(mut child) = monitor.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

impl DeviceBackend for LinuxBackend {
    fn inventory(&self) -> &Arc<Inventory> {
        &self.scanner.inventory
    }

    fn supervisor(&self) -> &Arc<Supervisor> {
        &self.scanner.supervisor
    }

    fn accepted_filesystems(&self) -> &Filesystems {
        &self.accepted
    }

    fn detect_removable_drives(&self) -> Result<Receiver<DriveEvent>> {
        let events = self.scanner.inventory.subscribe();
        self.scanner.scan()?;
        if let Err(e) = self.start_monitor() {
            warn!("Hotplug detection unavailable: {e}");
        }
        Ok(events)
    }

    fn mount_device(&self, key: &str) -> Result<PathBuf> {
        let drive = self.drive(key)?;
        if let Some(mount) = drive.mount.as_ref().filter(|m| m.exists()) {
            debug!("{} already mounted at {}", drive.device.display(), mount.display());
            return Ok(mount.clone());
        }

        info!("Mounting {}", drive.device.display());
        let device = drive.device.display().to_string();
        let result = self.run(
            "udisksctl",
            [
                OsStr::new("mount"),
                OsStr::new("--block-device"),
                drive.device.as_os_str(),
                OsStr::new("--no-user-interaction"),
            ],
        );
        let mount = match result {
            Ok(output) => parse_udisksctl_mount(&output.stdout).ok_or_else(|| Error::Mount {
                device: device.clone(),
                reason: format!("unexpected udisksctl output: {}", output.stdout.trim()),
            })?,
            Err(Error::ExternalTool { stderr, .. }) => match parse_already_mounted(&stderr) {
                Some(mount) => mount,
                None => {
                    return Err(Error::Mount {
                        device,
                        reason: stderr,
                    });
                }
            },
            Err(e) => return Err(e),
        };

        if !mount.exists() {
            return Err(Error::Mount {
                device,
                reason: format!("mount point {} does not exist", mount.display()),
            });
        }
        let free = statvfs_free(&mount).ok();
        let recorded = mount.clone();
        self.scanner.inventory.update(key, |d| {
            d.mount = Some(recorded);
            d.free = free;
        });
        Ok(mount)
    }

    fn unmount_device(&self, key: &str) -> Result<()> {
        let drive = self.drive(key)?;
        if drive.mount.is_none() {
            debug!("{} is not mounted", drive.device.display());
            return Ok(());
        }
        info!("Unmounting {}", drive.device.display());
        let output = self
            .scanner
            .supervisor
            .run("umount", [&drive.device], ExitPolicy::Passive)?;
        if output.success() {
            self.scanner.inventory.update(key, |d| {
                d.mount = None;
                d.free = None;
            });
        } else {
            warn!("Unable to unmount {}: {}", drive.device.display(), output.stderr.trim());
        }
        Ok(())
    }

    fn free_bytes(&self, drive: &Drive) -> Result<u64> {
        let mount = drive.mount.as_deref().ok_or_else(|| Error::NotMounted {
            device: drive.device.display().to_string(),
        })?;
        statvfs_free(mount)
    }

    fn set_label(&self, drive: &Drive, label: &str) -> Result<()> {
        let args = [drive.device.as_os_str(), OsStr::new(label)];
        if policy::is_fat(&drive.fstype) {
            // dosfslabel exits nonzero even when it succeeds.
            self.scanner.supervisor.run("dosfslabel", args, ExitPolicy::Passive)?;
        } else if policy::is_ext(&drive.fstype) {
            self.run("e2label", args)?;
        } else {
            return Err(Error::UnsupportedFilesystem {
                fstype: drive.fstype.clone(),
            });
        }
        Ok(())
    }

    fn format_device(&self, drive: &Drive, label: &str) -> Result<()> {
        info!("Formatting {} as FAT32", drive.device.display());
        self.run(
            "mkfs.vfat",
            [
                OsStr::new("-F"),
                OsStr::new("32"),
                OsStr::new("-n"),
                OsStr::new(label),
                drive.device.as_os_str(),
            ],
        )?;
        self.scanner.rescan(&drive.key)
    }

    fn mbr_matches_syslinux(&self, drive: &Drive) -> bool {
        let Some(mbr_bin) = Self::mbr_bin() else {
            warn!("Unable to find syslinux mbr.bin");
            return true;
        };
        let expected = read_boot_signature(&mbr_bin);
        let actual = self.master_boot_record(drive);
        debug!("syslinux mbr.bin = {expected:?}, device = {actual:?}");
        expected.is_some() && expected == actual
    }

    fn reset_master_boot_record(&self, drive: &Drive) -> Result<()> {
        let disk = drive.whole_disk();
        if disk.to_string_lossy().starts_with("/dev/loop") {
            debug!("Not resetting the MBR of loop device {}", disk.display());
            return Ok(());
        }
        let mbr_bin = Self::mbr_bin()
            .ok_or_else(|| Error::Precondition("Unable to find syslinux mbr.bin".into()))?;
        let code = fs::read(&mbr_bin).map_err(|e| Error::io(format!("reading {}", mbr_bin.display()), e))?;
        info!("Resetting Master Boot Record of {}", disk.display());
        let wrap = |e| Error::io(format!("writing boot code to {}", disk.display()), e);
        let mut device = OpenOptions::new().write(true).open(disk).map_err(wrap)?;
        device.write_all(&code).map_err(wrap)?;
        device.sync_all().map_err(wrap)
    }

    fn bootable_partition(&self, drive: &Drive) -> Result<()> {
        let Some(disk) = drive.parent.as_deref() else {
            debug!("No partitions on device; not marking any bootable");
            return Ok(());
        };
        let output = self.run("sfdisk", [OsStr::new("--json"), disk.as_os_str()])?;
        let table: Sfdisk = serde_json::from_str(&output.stdout)
            .map_err(|e| Error::Precondition(format!("Unable to read partition table: {e}")))?;
        if table.partitiontable.label != "dos" {
            warn!("{} does not have boot flag", drive.device.display());
            return Ok(());
        }
        let node = drive.device.to_string_lossy();
        let partition = table
            .partitiontable
            .partitions
            .iter()
            .find(|p| p.node == node)
            .ok_or_else(|| Error::Precondition(format!("Unable to find partition {node}")))?;
        if partition.bootable {
            debug!("{node} already bootable");
            return Ok(());
        }
        let number = partition_number(&partition.node)
            .ok_or_else(|| Error::Precondition(format!("Unable to find partition {node}")))?;
        self.run(
            "sfdisk",
            [
                OsString::from("--activate"),
                disk.as_os_str().to_owned(),
                OsString::from(number.to_string()),
            ],
        )?;
        info!("Marked {node} as bootable");
        Ok(())
    }

    fn flush_buffers(&self) -> Result<()> {
        self.scanner
            .supervisor
            .run("sync", std::iter::empty::<&str>(), ExitPolicy::Passive)?;
        Ok(())
    }

    fn is_admin(&self) -> Option<bool> {
        Some(nix::unistd::geteuid().is_root())
    }

    fn proxy_settings(&self) -> Proxies {
        let candidates = [
            dirs::home_dir().map(|h| h.join(".kde/share/config/kioslaverc")),
            dirs::config_dir().map(|c| c.join("kioslaverc")),
        ];
        let mut proxies = candidates
            .into_iter()
            .flatten()
            .find_map(|path| fs::read_to_string(path).ok())
            .map(|text| parse_kioslaverc(&text))
            .unwrap_or_default();
        for (proto, var) in [("http", "http_proxy"), ("ftp", "ftp_proxy")] {
            if let Ok(value) = std::env::var(var).or_else(|_| std::env::var(var.to_uppercase())) {
                proxies.entry(proto.to_string()).or_insert(value);
            }
        }
        proxies
    }

    fn verify_implanted_md5(&self, image: &Path) -> Result<bool> {
        match self.run("checkisomd5", [image]) {
            Ok(_) => Ok(true),
            Err(Error::ExternalTool { stderr, .. }) => {
                error!("ISO MD5 checksum verification failed: {stderr}");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn extract_image(&self, image: &Path, dest: &Path) -> Result<()> {
        let staging = LoopMount::new(&self.scanner.supervisor, image)?;
        let src = staging.path();
        let src_liveos = src.join(LIVEOS_DIR);
        if !src_liveos.is_dir() {
            return Err(Error::Precondition("Unable to find LiveOS on ISO".into()));
        }

        let liveos = payload::liveos_dir(dest);
        fs::create_dir_all(&liveos)
            .map_err(|e| Error::io(format!("creating {}", liveos.display()), e))?;
        self.run(
            "cp",
            [src_liveos.join("squashfs.img"), liveos.join("squashfs.img")],
        )?;

        let osmin = src_liveos.join("osmin.img");
        if osmin.exists() {
            self.run("cp", [osmin, liveos.join("osmin.img")])?;
        } else {
            debug!("No osmin.img found");
        }

        let isolinux = dest.join(ISOLINUX_DIR);
        fs::create_dir_all(&isolinux)
            .map_err(|e| Error::io(format!("creating {}", isolinux.display()), e))?;
        self.run(
            "cp",
            [
                PathBuf::from("-r"),
                src.join(ISOLINUX_DIR).join("."),
                isolinux,
            ],
        )?;

        if payload::needs_efi_copy(src, dest) {
            let efi = dest.join(EFI_DIR);
            fs::create_dir_all(&efi).map_err(|e| Error::io(format!("creating {}", efi.display()), e))?;
            self.run("cp", [PathBuf::from("-r"), src.join(EFI_DIR).join("."), efi])?;
        } else {
            debug!("Keeping the EFI directory already on {}", dest.display());
        }
        Ok(())
    }

    fn install_bootloader(&self, drive: &Drive, dest: &Path, options: &InstallOptions) -> Result<()> {
        let syslinux = payload::move_isolinux_to_syslinux(dest)?;
        Self::copy_com32_module(&syslinux);
        payload::delete_ldlinux(&self.scanner.supervisor, dest)?;

        if policy::is_ext(&drive.fstype) {
            let cfg = syslinux.join("syslinux.cfg");
            let conf = syslinux.join("extlinux.conf");
            fs::rename(&cfg, &conf).map_err(|e| Error::io(format!("renaming {}", cfg.display()), e))?;
            self.run("extlinux", [OsStr::new("-i"), syslinux.as_os_str()])?;
        } else {
            let mut args: Vec<OsString> = Vec::new();
            if options.force.is_some() {
                args.push("-f".into());
            }
            if options.safe {
                args.push("-s".into());
            }
            args.extend([
                OsString::from("-d"),
                OsString::from(SYSLINUX_DIR),
                drive.device.as_os_str().to_owned(),
            ]);
            self.run("syslinux", &args)?;
        }
        Ok(())
    }

    fn write_raw_image(&self, image: &Path, drive: &Drive) -> Result<()> {
        let mut input = OsString::from("if=");
        input.push(image);
        let mut output = OsString::from("of=");
        output.push(drive.whole_disk());
        self.run(
            "dd",
            [
                input,
                output,
                "bs=1M".into(),
                "iflag=direct".into(),
                "oflag=direct".into(),
                "conv=fdatasync".into(),
            ],
        )?;
        Ok(())
    }

    fn raw_device_size(&self, drive: &Drive) -> u64 {
        let disk = self.raw_device_path(drive);
        let mut size: u64 = 0;
        if let Ok(file) = File::open(&disk) {
            // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer.
            if unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }.is_ok() && size > 0 {
                return size;
            }
        }
        drive.disk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSBLK_JSON: &str = r#"{
       "blockdevices": [
          {"name":"/dev/nvme0n1", "kname":"/dev/nvme0n1", "pkname":null, "type":"disk", "fstype":null,
           "fsver":null, "label":null, "uuid":null, "mountpoints":[null], "size":512110190592,
           "rm":false, "hotplug":false, "tran":"nvme", "vendor":null, "model":"Samsung SSD 970",
           "children": [
              {"name":"/dev/nvme0n1p1", "kname":"/dev/nvme0n1p1", "pkname":"/dev/nvme0n1", "type":"part",
               "fstype":"vfat", "fsver":"FAT32", "label":null, "uuid":"AAAA-BBBB", "mountpoints":["/boot/efi"],
               "size":629145600, "rm":false, "hotplug":false, "tran":null, "vendor":null, "model":null},
              {"name":"/dev/nvme0n1p2", "kname":"/dev/nvme0n1p2", "pkname":"/dev/nvme0n1", "type":"part",
               "fstype":"ext4", "fsver":"1.0", "label":null, "uuid":"root-uuid", "mountpoints":["/"],
               "size":511480000000, "rm":false, "hotplug":false, "tran":null, "vendor":null, "model":null}
           ]
          },
          {"name":"/dev/sdb", "kname":"/dev/sdb", "pkname":null, "type":"disk", "fstype":null,
           "fsver":null, "label":null, "uuid":null, "mountpoints":[null], "size":"16008609792",
           "rm":"1", "hotplug":"1", "tran":"usb", "vendor":"SanDisk ", "model":"Cruzer Blade    ",
           "children": [
              {"name":"/dev/sdb1", "kname":"/dev/sdb1", "pkname":"/dev/sdb", "type":"part",
               "fstype":"vfat", "fsver":"FAT32", "label":"MYSTICK", "uuid":"1234-ABCD", "mountpoints":[null],
               "size":"16007561216", "rm":"1", "hotplug":"1", "tran":null, "vendor":null, "model":null}
           ]
          },
          {"name":"/dev/sr0", "kname":"/dev/sr0", "type":"rom", "fstype":"iso9660", "label":"Fedora-Live",
           "mountpoints":["/run/media/u/Fedora-Live"], "size":1500000000, "rm":true, "hotplug":true,
           "tran":"sata"}
       ]
    }"#;

    fn parsed() -> Vec<(Probe, Drive)> {
        let lsblk: Lsblk = serde_json::from_str(LSBLK_JSON).unwrap();
        candidates(&lsblk.blockdevices, None)
    }

    #[test]
    fn lsblk_tree_is_flattened() {
        let all = parsed();
        let keys: Vec<_> = all.iter().map(|(_, d)| d.key.as_str()).collect();
        assert_eq!(keys, vec!["nvme0n1p1", "nvme0n1p2", "sdb1", "sr0"]);

        let (probe, drive) = &all[2];
        assert!(probe.removable);
        assert_eq!(probe.bus.as_deref(), Some("usb"));
        assert!(!probe.on_system_disk);
        assert_eq!(drive.device, PathBuf::from("/dev/sdb1"));
        assert_eq!(drive.parent, Some(PathBuf::from("/dev/sdb")));
        assert_eq!(drive.fstype, "vfat");
        assert_eq!(drive.label, "MYSTICK");
        assert_eq!(drive.mount, None);
        assert_eq!(drive.size, 16_007_561_216);
        assert_eq!(drive.disk_size, 16_008_609_792);
        assert_eq!(drive.friendly_name, "SanDisk Cruzer Blade");
    }

    #[test]
    fn only_the_usb_stick_is_admitted() {
        let policy = EnumerationPolicy::new(Filesystems::for_extlinux(Some(6)), None);
        let admitted: Vec<_> = parsed()
            .into_iter()
            .filter(|(probe, _)| policy.admit(probe).is_ok())
            .map(|(_, d)| d.key)
            .collect();
        assert_eq!(admitted, vec!["sdb1"]);

        let (probe, _) = &parsed()[1];
        assert!(probe.on_system_disk);
    }

    #[test]
    fn udev_lines() {
        assert_eq!(
            parse_udev_line("UDEV  [8201.334821] add      /devices/pci0000:00/0000:00:14.0/usb2/2-1/2-1:1.0/host6/target6:0:0/6:0:0:0/block/sdb/sdb1 (block)"),
            Some(UdevEvent {
                action: "add".into(),
                name: "sdb1".into()
            })
        );
        assert_eq!(
            parse_udev_line("UDEV  [8230.120000] remove   /devices/virtual/block/loop3 (block)")
                .map(|e| e.action),
            Some("remove".into())
        );
        assert_eq!(parse_udev_line("monitor will print the received events for:"), None);
        assert_eq!(parse_udev_line("KERNEL[8201.3] add /devices/x/block/sdb (block)"), None);
    }

    #[test]
    fn udisksctl_messages() {
        assert_eq!(
            parse_udisksctl_mount("Mounted /dev/sdb1 at /run/media/user/LIVE.\n"),
            Some(PathBuf::from("/run/media/user/LIVE"))
        );
        assert_eq!(
            parse_udisksctl_mount("Mounted /dev/sdb1 at /media/LIVE\n"),
            Some(PathBuf::from("/media/LIVE"))
        );
        assert_eq!(parse_udisksctl_mount("nothing useful"), None);
        assert_eq!(
            parse_already_mounted(
                "Error mounting /dev/sdb1: GDBus.Error:org.freedesktop.UDisks2.Error.AlreadyMounted: Device /dev/sdb1 is already mounted at `/run/media/user/LIVE'.\n"
            ),
            Some(PathBuf::from("/run/media/user/LIVE"))
        );
        assert_eq!(parse_already_mounted("Error: not authorized"), None);
    }

    #[test]
    fn extlinux_versions() {
        assert_eq!(
            parse_extlinux_version("extlinux 6.04 0x5d9bde91  Copyright 1994-2015 H. Peter Anvin et al"),
            Some(6)
        );
        assert_eq!(parse_extlinux_version("extlinux 4.05  Copyright"), Some(4));
        assert_eq!(parse_extlinux_version("extlinux: unknown option"), None);
    }

    #[test]
    fn kde_manual_proxy() {
        let rc = "[General]\nfoo=bar\n\n[Proxy Settings]\nProxyType=1\nhttpProxy=http://proxy:3128\nftpProxy=\n";
        let proxies = parse_kioslaverc(rc);
        assert_eq!(proxies.get("http").map(String::as_str), Some("http://proxy:3128"));
        assert!(!proxies.contains_key("ftp"));

        let automatic = "[Proxy Settings]\nProxyType=2\nhttpProxy=http://proxy:3128\n";
        assert!(parse_kioslaverc(automatic).is_empty());
    }

    #[test]
    fn partition_numbers() {
        assert_eq!(partition_number("/dev/sdb1"), Some(1));
        assert_eq!(partition_number("/dev/mmcblk0p12"), Some(12));
        assert_eq!(partition_number("/dev/sdb"), None);
    }

    #[test]
    fn sfdisk_json() {
        let json = r#"{"partitiontable": {"label":"dos", "id":"0x1", "device":"/dev/sdb", "unit":"sectors",
            "partitions": [{"node":"/dev/sdb1", "start":2048, "size":31264768, "type":"c", "bootable":true},
                           {"node":"/dev/sdb2", "start":31266816, "size":2048, "type":"83"}]}}"#;
        let table: Sfdisk = serde_json::from_str(json).unwrap();
        assert_eq!(table.partitiontable.label, "dos");
        assert!(table.partitiontable.partitions[0].bootable);
        assert!(!table.partitiontable.partitions[1].bootable);
    }

    #[test]
    fn hotplug_scanner_survives_cancelled_install() {
        let install = Arc::new(Supervisor::with_log_path("/tmp/install.log"));
        let scanner = Scanner {
            supervisor: Arc::clone(&install),
            inventory: Arc::new(Inventory::new()),
            policy: EnumerationPolicy::new(Filesystems::fat(), None),
        };
        let hotplug = scanner.detached(hotplug_log_path());

        install.terminate();
        assert!(install.is_cancelled());
        assert!(!hotplug.supervisor.is_cancelled());
        assert!(!Arc::ptr_eq(&hotplug.supervisor, &install));
        assert!(Arc::ptr_eq(&hotplug.inventory, &scanner.inventory));
        assert_ne!(hotplug.supervisor.log_path(), install.log_path());
        assert_eq!(
            hotplug_log_path().file_name().and_then(OsStr::to_str),
            Some("liveusb-creator-hotplug.log")
        );
    }
}

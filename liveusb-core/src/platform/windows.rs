//! Windows backend: removable drive letters via Win32, `7z` extraction and
//! the bundled `syslinux.exe`.
use crate::device::{Drive, DriveEvent};
use crate::error::{Error, Result};
use crate::inventory::Inventory;
use crate::options::InstallOptions;
use crate::payload::{self, SYSLINUX_DIR};
use crate::platform::{DeviceBackend, Proxies};
use crate::policy::{EnumerationPolicy, Filesystems, Probe};
use crate::process::{ExitPolicy, Output, Supervisor};
use std::collections::BTreeSet;
use std::ffi::{OsStr, OsString};
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use windows_sys::Win32::Storage::FileSystem::{
    GetDiskFreeSpaceExW, GetDriveTypeW, GetLogicalDrives, GetVolumeInformationW, SetVolumeLabelW,
};

const DRIVE_REMOVABLE: u32 = 2;
const DRIVE_CDROM: u32 = 5;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Bundled tools live in `tools\` next to the executable.
const TOOLS_DIR: &str = "tools";

const INTERNET_SETTINGS: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

fn wide(s: impl AsRef<OsStr>) -> Vec<u16> {
    s.as_ref().encode_wide().chain(std::iter::once(0)).collect()
}

fn from_wide(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

/// `E:` becomes `E:\`.
fn root_of(letter: &str) -> String {
    format!("{letter}\\")
}

fn logical_drives() -> Vec<String> {
    // SAFETY: no arguments; returns a bitmask.
    let mask = unsafe { GetLogicalDrives() };
    (0..26u8)
        .filter(|i| mask & (1 << i) != 0)
        .map(|i| format!("{}:", (b'A' + i) as char))
        .collect()
}

struct Volume {
    label: String,
    serial: u32,
    filesystem: String,
}

fn volume_information(letter: &str) -> io::Result<Volume> {
    let root = wide(root_of(letter));
    let mut label = [0u16; 261];
    let mut filesystem = [0u16; 261];
    let mut serial = 0u32;
    let mut max_component = 0u32;
    let mut flags = 0u32;
    // SAFETY: buffers are sized as passed; out pointers are valid locals.
    let ok = unsafe {
        GetVolumeInformationW(
            root.as_ptr(),
            label.as_mut_ptr(),
            label.len() as u32,
            &mut serial,
            &mut max_component,
            &mut flags,
            filesystem.as_mut_ptr(),
            filesystem.len() as u32,
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Volume {
        label: from_wide(&label),
        serial,
        filesystem: from_wide(&filesystem),
    })
}

/// Returns `(free, total)` bytes for the volume at `root`.
fn disk_space(root: &str) -> io::Result<(u64, u64)> {
    let root = wide(root);
    let mut free = 0u64;
    let mut total = 0u64;
    let mut total_free = 0u64;
    // SAFETY: out pointers are valid locals.
    let ok = unsafe { GetDiskFreeSpaceExW(root.as_ptr(), &mut free, &mut total, &mut total_free) };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((free, total))
}

/// Volume serial numbers print like FAT UUIDs on Linux, `1234-ABCD`.
fn format_serial(serial: u32) -> String {
    format!("{:04X}-{:04X}", serial >> 16, serial & 0xffff)
}

/// Windows reports `FAT`/`FAT32`; everything downstream speaks `vfat`.
fn normalize_fstype(filesystem: &str) -> String {
    match filesystem.to_ascii_uppercase().as_str() {
        "FAT" | "FAT32" => "vfat".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

fn system_drive() -> Option<String> {
    std::env::var("SystemDrive")
        .ok()
        .map(|d| d.trim_end_matches('\\').to_ascii_uppercase())
}

fn probe_letter(letter: &str) -> Option<(Probe, Drive)> {
    let root = wide(root_of(letter));
    // SAFETY: `root` is a NUL-terminated wide string.
    let drive_type = unsafe { GetDriveTypeW(root.as_ptr()) };
    let volume = match volume_information(letter) {
        Ok(volume) => volume,
        Err(e) => {
            debug!("Unable to get volume information for {letter}: {e}");
            return None;
        }
    };
    let (free, total) = disk_space(&root_of(letter)).unwrap_or((0, 0));
    let fstype = normalize_fstype(&volume.filesystem);
    let mount = PathBuf::from(root_of(letter));

    let probe = Probe {
        device: PathBuf::from(letter),
        removable: drive_type == DRIVE_REMOVABLE,
        optical: drive_type == DRIVE_CDROM,
        bus: None,
        on_system_disk: system_drive().as_deref() == Some(letter),
        mounts: vec![mount.clone()],
        size: total,
        fstype: fstype.clone(),
    };
    let drive = Drive {
        key: letter.to_string(),
        device: PathBuf::from(letter),
        parent: None,
        fstype,
        fsversion: volume.filesystem,
        label: volume.label,
        uuid: format_serial(volume.serial),
        mount: Some(mount),
        size: total,
        disk_size: total,
        free: Some(free),
        friendly_name: String::new(),
    };
    Some((probe, drive))
}

/// Parses `reg query` output for the Internet Settings key.
fn parse_reg_proxy(text: &str) -> Proxies {
    let mut enabled = false;
    let mut server = None;
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["ProxyEnable", "REG_DWORD", value] => {
                enabled = u32::from_str_radix(value.trim_start_matches("0x"), 16).unwrap_or(0) != 0;
            }
            ["ProxyServer", "REG_SZ", value] => server = Some(value.to_string()),
            _ => {}
        }
    }

    let mut proxies = Proxies::new();
    let Some(server) = server.filter(|_| enabled) else {
        return proxies;
    };
    if server.contains('=') {
        for entry in server.split(';') {
            if let Some((protocol, address)) = entry.split_once('=') {
                proxies.insert(protocol.to_string(), format!("{protocol}://{address}"));
            }
        }
    } else {
        proxies.insert("http".into(), format!("http://{server}"));
        proxies.insert("ftp".into(), format!("ftp://{server}"));
    }
    proxies
}

/// Shared between the backend and its polling thread.
#[derive(Clone)]
struct Scanner {
    inventory: Arc<Inventory>,
    policy: EnumerationPolicy,
}

impl Scanner {
    fn add(&self, letter: &str) {
        let Some((probe, drive)) = probe_letter(letter) else {
            return;
        };
        match self.policy.admit(&probe) {
            Ok(()) => {
                info!("Found {letter}");
                self.inventory.insert(drive);
            }
            Err(skip) => debug!("Skipping {letter}: {skip}"),
        }
    }

    fn scan(&self) -> BTreeSet<String> {
        let letters: BTreeSet<String> = logical_drives().into_iter().collect();
        for letter in &letters {
            self.add(letter);
        }
        letters
    }
}

struct Watcher {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Windows implementation of [`DeviceBackend`].
pub struct WindowsBackend {
    supervisor: Arc<Supervisor>,
    scanner: Scanner,
    accepted: Filesystems,
    watcher: Mutex<Option<Watcher>>,
}

impl WindowsBackend {
    pub fn new(force: Option<PathBuf>) -> Result<Self> {
        let accepted = Filesystems::fat();
        Ok(Self {
            supervisor: Arc::new(Supervisor::new()),
            scanner: Scanner {
                inventory: Arc::new(Inventory::new()),
                policy: EnumerationPolicy::new(accepted.clone(), force),
            },
            accepted,
            watcher: Mutex::new(None),
        })
    }

    fn drive(&self, key: &str) -> Result<Drive> {
        self.scanner
            .inventory
            .get(key)
            .ok_or_else(|| Error::DeviceNotFound(key.to_string()))
    }

    /// Finds a bundled tool, falling back to `PATH`.
    fn tool(&self, name: &str) -> Result<String> {
        let exe = format!("{name}.exe");
        let mut dirs: Vec<PathBuf> = Vec::new();
        if let Some(dir) = std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
            dirs.push(dir.join(TOOLS_DIR));
        }
        if let Ok(program_files) = std::env::var("PROGRAMFILES") {
            dirs.push(Path::new(&program_files).join("LiveUSB Creator").join(TOOLS_DIR));
            dirs.push(Path::new(&format!("{program_files} (x86)")).join("LiveUSB Creator").join(TOOLS_DIR));
        }
        dirs.push(PathBuf::from(TOOLS_DIR));

        dirs.into_iter()
            .map(|dir| dir.join(&exe))
            .find(|path| path.is_file())
            .or_else(|| which::which(name).ok())
            .map(|path| path.to_string_lossy().into_owned())
            .ok_or_else(|| Error::ToolNotFound {
                program: name.to_string(),
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    "make sure to extract the entire liveusb archive before running this program",
                ),
            })
    }

    fn run_tool<I, S>(&self, name: &str, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let tool = self.tool(name)?;
        self.supervisor.run(&tool, args, ExitPolicy::Strict)
    }

    fn start_watcher(&self) -> Result<()> {
        let mut watcher = self
            .watcher
            .lock()
            .map_err(|_| Error::Precondition("drive watcher state poisoned".into()))?;
        if watcher.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let scanner = self.scanner.clone();
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("drive-watcher".into())
            .spawn(move || {
                let mut known: BTreeSet<String> = logical_drives().into_iter().collect();
                while !flag.load(Ordering::SeqCst) {
                    thread::sleep(POLL_INTERVAL);
                    let current: BTreeSet<String> = logical_drives().into_iter().collect();
                    for letter in current.difference(&known) {
                        scanner.add(letter);
                    }
                    for letter in known.difference(&current) {
                        if scanner.inventory.remove(letter).is_some() {
                            info!("{letter} removed");
                        }
                    }
                    known = current;
                }
            })
            .map_err(|e| Error::io("starting drive watcher", e))?;
        *watcher = Some(Watcher { stop, handle });
        Ok(())
    }
}

impl Drop for WindowsBackend {
    fn drop(&mut self) {
        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(watcher) = watcher.take() {
                watcher.stop.store(true, Ordering::SeqCst);
                let _ = watcher.handle.join();
            }
        }
    }
}

impl DeviceBackend for WindowsBackend {
    fn inventory(&self) -> &Arc<Inventory> {
        &self.scanner.inventory
    }

    fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    fn accepted_filesystems(&self) -> &Filesystems {
        &self.accepted
    }

    fn detect_removable_drives(&self) -> Result<Receiver<DriveEvent>> {
        let events = self.scanner.inventory.subscribe();
        self.scanner.scan();
        self.start_watcher()?;
        Ok(events)
    }

    /// Drive letters are always mounted.
    fn mount_device(&self, key: &str) -> Result<PathBuf> {
        let drive = self.drive(key)?;
        Ok(drive.mount.unwrap_or_else(|| PathBuf::from(root_of(key))))
    }

    fn unmount_device(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn free_bytes(&self, drive: &Drive) -> Result<u64> {
        let root = root_of(&drive.device.to_string_lossy());
        disk_space(&root)
            .map(|(free, _)| free)
            .map_err(|e| Error::FreeSpaceUnavailable {
                path: PathBuf::from(&root),
                reason: e.to_string(),
            })
    }

    fn set_label(&self, drive: &Drive, label: &str) -> Result<()> {
        let root = wide(root_of(&drive.device.to_string_lossy()));
        let name = wide(label);
        // SAFETY: both are NUL-terminated wide strings.
        let ok = unsafe { SetVolumeLabelW(root.as_ptr(), name.as_ptr()) };
        if ok == 0 {
            return Err(Error::io(
                format!("Unable to SetVolumeLabel on {}", drive.device.display()),
                io::Error::last_os_error(),
            ));
        }
        debug!("Set {} label to {label}", drive.device.display());
        Ok(())
    }

    fn format_device(&self, drive: &Drive, label: &str) -> Result<()> {
        info!("Formatting {} as FAT32", drive.device.display());
        let label = format!("/V:{label}");
        self.supervisor.run(
            "format",
            [
                OsStr::new("/Q"),
                OsStr::new("/X"),
                OsStr::new("/y"),
                OsStr::new(&label),
                OsStr::new("/FS:FAT32"),
                drive.device.as_os_str(),
            ],
            ExitPolicy::Strict,
        )?;
        self.scanner.add(&drive.key);
        Ok(())
    }

    fn is_admin(&self) -> Option<bool> {
        match self
            .supervisor
            .run("net", ["session"], ExitPolicy::Passive)
        {
            Ok(output) => Some(output.success()),
            Err(e) => {
                debug!("Unable to determine privileges: {e}");
                None
            }
        }
    }

    fn proxy_settings(&self) -> Proxies {
        match self
            .supervisor
            .run("reg", ["query", INTERNET_SETTINGS], ExitPolicy::Passive)
        {
            Ok(output) => {
                let proxies = parse_reg_proxy(&output.stdout);
                debug!("Using proxies: {proxies:?}");
                proxies
            }
            Err(e) => {
                warn!("Unable to detect proxy settings: {e}");
                Proxies::new()
            }
        }
    }

    fn extract_image(&self, image: &Path, dest: &Path) -> Result<()> {
        let mut output = OsString::from("-o");
        output.push(dest);
        self.run_tool(
            "7z",
            [
                OsString::from("x"),
                image.as_os_str().to_owned(),
                OsString::from("-x![BOOT]"),
                OsString::from("-y"),
                output,
            ],
        )?;
        Ok(())
    }

    fn install_bootloader(&self, drive: &Drive, dest: &Path, options: &InstallOptions) -> Result<()> {
        payload::move_isolinux_to_syslinux(dest)?;
        payload::delete_ldlinux(&self.supervisor, dest)?;

        let mut args: Vec<OsString> = Vec::new();
        if options.force.is_some() {
            args.push("-f".into());
        }
        if options.safe {
            args.push("-s".into());
        }
        args.extend([
            OsString::from("-m"),
            OsString::from("-a"),
            OsString::from("-d"),
            OsString::from(SYSLINUX_DIR),
            drive.device.as_os_str().to_owned(),
        ]);
        self.run_tool("syslinux", &args)?;
        Ok(())
    }

    fn raw_device_path(&self, drive: &Drive) -> PathBuf {
        PathBuf::from(format!(r"\\.\{}", drive.device.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serials_look_like_fat_uuids() {
        assert_eq!(format_serial(0x1234_abcd), "1234-ABCD");
        assert_eq!(format_serial(0x0000_0001), "0000-0001");
    }

    #[test]
    fn fat_is_reported_as_vfat() {
        assert_eq!(normalize_fstype("FAT32"), "vfat");
        assert_eq!(normalize_fstype("FAT"), "vfat");
        assert_eq!(normalize_fstype("NTFS"), "ntfs");
    }

    #[test]
    fn registry_proxy_settings() {
        let single = "\r\nHKEY_CURRENT_USER\\Software\\Microsoft\\Windows\\CurrentVersion\\Internet Settings\r\n    ProxyEnable    REG_DWORD    0x1\r\n    ProxyServer    REG_SZ    proxy.example.org:3128\r\n";
        let proxies = parse_reg_proxy(single);
        assert_eq!(proxies.get("http").map(String::as_str), Some("http://proxy.example.org:3128"));
        assert_eq!(proxies.get("ftp").map(String::as_str), Some("ftp://proxy.example.org:3128"));

        let split = "    ProxyEnable    REG_DWORD    0x1\n    ProxyServer    REG_SZ    http=h:80;ftp=f:21\n";
        let proxies = parse_reg_proxy(split);
        assert_eq!(proxies.get("http").map(String::as_str), Some("http://h:80"));
        assert_eq!(proxies.get("ftp").map(String::as_str), Some("ftp://f:21"));

        let disabled = "    ProxyEnable    REG_DWORD    0x0\n    ProxyServer    REG_SZ    h:80\n";
        assert!(parse_reg_proxy(disabled).is_empty());
    }
}

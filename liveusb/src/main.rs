use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use liveusb_core::checksum::{self, HashAlgorithm};
use liveusb_core::pipeline::{Installer, Observer, Stage};
use liveusb_core::platform::{self, DeviceBackend};
use liveusb_core::release::ReleaseCatalog;
use liveusb_core::{Drive, InstallOptions};
use std::io::{IsTerminal, stdout};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "liveusb")]
#[command(about = "Install a live ISO image onto a removable drive", version)]
struct Cli {
    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this device even if it does not look like a removable drive
    #[arg(long, global = true, value_name = "DEVICE")]
    force: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the drives an image can be installed to
    List,
    /// Install a live image onto a drive
    Write {
        /// Live ISO image (may be .gz, .xz or .zst compressed)
        #[arg(required = true)]
        image: PathBuf,

        /// Target drive, by key or device path; asked for if omitted
        #[arg(short, long)]
        device: Option<String>,

        /// Volume label for the target
        #[arg(short, long, default_value = liveusb_core::options::DEFAULT_LABEL)]
        label: String,

        /// Size of the persistent overlay in MB
        #[arg(short, long = "overlay-size-mb", default_value_t = 0)]
        overlay_size_mb: u64,

        /// Extra kernel arguments, comma separated
        #[arg(short, long = "kernel-args")]
        kernel_args: Option<String>,

        /// Skip image checksum verification
        #[arg(short = 'n', long = "noverify")]
        no_verify: bool,

        /// Also check the MD5 implanted in the image
        #[arg(long)]
        md5: bool,

        /// Use the "safe, slow and stupid" syslinux mode
        #[arg(long)]
        safe: bool,

        /// Make the drive bootable on the OLPC XO
        #[arg(long)]
        xo: bool,

        /// Reset the Master Boot Record if it is blank or not syslinux's
        #[arg(long = "reset-mbr")]
        reset_mbr: bool,

        /// Reformat the drive as FAT32 first. Destroys all data on it
        #[arg(long)]
        format: bool,

        /// Write the image over the whole disk instead of installing files
        #[arg(long)]
        raw: bool,

        /// Release catalog (JSON) to verify the image against
        #[arg(long, value_name = "FILE")]
        releases: Option<PathBuf>,

        /// Do not ask for confirmation
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },
    /// Compute the checksum of a whole drive
    Checksum {
        #[arg(short, long)]
        device: Option<String>,

        #[arg(long = "hash", default_value = "sha1")]
        hash: HashAlgorithm,
    },
    /// Compute the diagnostic checksum of an installed Live OS
    LiveosChecksum {
        #[arg(short, long)]
        device: Option<String>,

        #[arg(long = "hash", default_value = "sha1")]
        hash: HashAlgorithm,
    },
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let original_termios = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            let fd = stdout().as_raw_fd();
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn bar_style(color: &str) -> ProgressStyle {
    let template = format!(
        "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
    );
    ProgressStyle::default_bar()
        .template(&template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("■ ")
}

fn spinner_style() -> ProgressStyle {
    // A block of squares bouncing across a 40-column track.
    let width = 40;
    let block = "■  ■  ■  ■  ■  ■  ■";
    let travel = width - block.chars().count();
    let frames: Vec<String> = (0..=travel)
        .chain((0..travel).rev())
        .map(|offset| {
            let line = format!("{}{block}{}", " ".repeat(offset), " ".repeat(travel - offset));
            style(line).blue().to_string()
        })
        .collect();
    let frames: Vec<&str> = frames.iter().map(String::as_str).collect();
    ProgressStyle::default_spinner()
        .template("{prefix:12} [{elapsed_precise}] [{spinner}] {bytes} ({bytes_per_sec}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&frames)
}

/// Connects the pipeline's progress reporting to the terminal.
struct ConsoleProgress {
    decompress: Option<ProgressBar>,
    verify: Option<ProgressBar>,
}

impl ConsoleProgress {
    fn new() -> Self {
        Self {
            decompress: None,
            verify: None,
        }
    }

    fn finish(&mut self) {
        if let Some(pb) = self.decompress.take() {
            pb.finish_with_message("Decompression complete.");
        }
        if let Some(pb) = self.verify.take() {
            pb.finish_with_message("Verification complete.");
        }
    }

    fn abandon(&mut self) {
        for pb in [self.decompress.take(), self.verify.take()].into_iter().flatten() {
            pb.abandon_with_message("❌ Operation failed.");
        }
    }
}

impl Observer for ConsoleProgress {
    fn stage(&mut self, stage: Stage) {
        self.finish();
        println!("{} {stage}...", style("==>").cyan().bold());
    }

    fn decompress_progress(&mut self, bytes: u64) {
        let pb = self.decompress.get_or_insert_with(|| {
            let pb = ProgressBar::new_spinner();
            pb.set_prefix("Decompress");
            pb.set_style(spinner_style());
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        });
        pb.set_position(bytes);
    }

    fn verify_started(&mut self, kib: u64) {
        let pb = ProgressBar::new(kib * 1024);
        pb.set_prefix("Verifying");
        pb.set_style(bar_style("magenta"));
        self.verify = Some(pb);
    }

    fn verify_progress(&mut self, kib: u64) {
        if let Some(pb) = &self.verify {
            pb.set_position(kib * 1024);
        }
    }
}

/// Presents an interactive menu for the user to select a drive.
fn select_drive(drives: &[Drive], prompt: &str) -> Result<Drive> {
    if drives.is_empty() {
        return Err(anyhow!("No removable drives found."));
    }

    let items: Vec<String> = drives.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(drives[selection].clone())
}

/// Picks the drive named on the command line, or asks for one.
fn resolve_drive(backend: &dyn DeviceBackend, device: Option<&str>, prompt: &str) -> Result<Drive> {
    match device {
        Some(device) => backend
            .inventory()
            .find(device)
            .ok_or_else(|| liveusb_core::Error::DeviceNotFound(device.to_string()).into()),
        None => select_drive(&backend.inventory().drives(), prompt),
    }
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

/// Creates the backend, wires Ctrl+C to its supervisor and enumerates drives.
fn start_backend(force: Option<PathBuf>) -> Result<Box<dyn DeviceBackend>> {
    let backend = platform::native(force)?;
    let supervisor = Arc::clone(backend.supervisor());
    debug!("External tool output is logged to {}", supervisor.log_path().display());
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling...");
        supervisor.terminate();
    })?;
    backend.detect_removable_drives()?;
    Ok(backend)
}

fn list(backend: &dyn DeviceBackend) {
    let drives = backend.inventory().drives();
    if drives.is_empty() {
        println!("No removable drives found.");
        return;
    }

    println!("Found {} removable drives:", drives.len());
    println!(
        "\n  {:<12} {:<10} {:<8} {:<12} {:<25} {}",
        "DEVICE", "SIZE", "FS", "LABEL", "NAME", "LOCATION"
    );
    println!(
        "  {:-<12} {:-<10} {:-<8} {:-<12} {:-<25} {:-<20}",
        "", "", "", "", "", ""
    );
    for drive in drives {
        let location = match &drive.mount {
            Some(mount) => mount.display().to_string(),
            None => "(Not mounted)".to_string(),
        };
        println!(
            "  {:<12} {:>7.1} GB {:<8} {:<12} {:<25} {}",
            drive.device.display(),
            drive.size as f64 / (1024.0 * 1024.0 * 1024.0),
            drive.fstype,
            drive.label,
            drive.friendly_name,
            location
        );
    }
}

fn run(cli: Cli) -> Result<()> {
    let backend = start_backend(cli.force.clone())?;
    let backend = backend.as_ref();

    if backend.is_admin() == Some(false) {
        println!(
            "{} Not running with administrator privileges; some steps may fail.",
            style("NOTE:").yellow().bold()
        );
    }

    match cli.command {
        Commands::List => list(backend),
        Commands::Write {
            image,
            device,
            label,
            overlay_size_mb,
            kernel_args,
            no_verify,
            md5,
            safe,
            xo,
            reset_mbr,
            format,
            raw,
            releases,
            yes,
        } => {
            let catalog = match &releases {
                Some(path) => ReleaseCatalog::load(path)?,
                None => ReleaseCatalog::default(),
            };
            let drive = resolve_drive(backend, device.as_deref(), "Select the target drive")?;

            if raw || format {
                println!(
                    "{} This will erase all data on '{}' ({:.1} GB).",
                    style("WARNING:").red().bold(),
                    if raw { drive.whole_disk() } else { drive.device.as_path() }.display(),
                    drive.disk_size as f64 / (1024.0 * 1024.0 * 1024.0),
                );
            } else {
                println!(
                    "This will install a Live OS onto '{}', replacing any existing one.",
                    drive.device.display()
                );
            }
            println!("  Device: {}", style(drive.device.display()).cyan());
            println!("  Image:  {}", style(image.display()).cyan());
            if overlay_size_mb > 0 {
                println!("  Persistent storage: {overlay_size_mb} MB");
            }
            println!();

            if !yes && !confirm_operation("Are you sure you want to proceed?")? {
                println!("Write operation cancelled.");
                return Ok(());
            }
            println!();

            let options = InstallOptions {
                label,
                overlay_mib: overlay_size_mb,
                kernel_args,
                force: cli.force,
                no_verify,
                verify_md5: md5,
                safe,
                xo,
                reset_mbr,
                format,
                raw,
                ..Default::default()
            };
            let mut installer = Installer::new(backend, options)?.with_catalog(catalog);
            let mut progress = ConsoleProgress::new();
            let result = installer.run(&image, &drive.key, &mut progress);
            match result {
                Ok(()) => {
                    progress.finish();
                    if let Some(rate) = installer.context().mb_per_sec {
                        println!("Wrote to device at {rate:.0} MB/sec");
                    }
                    println!(
                        "\n✨ Successfully installed {} onto {}.",
                        style(image.display()).cyan(),
                        style(drive.device.display()).cyan()
                    );
                }
                Err(e) => {
                    progress.abandon();
                    return Err(e.into());
                }
            }
        }
        Commands::Checksum { device, hash } => {
            let drive = resolve_drive(backend, device.as_deref(), "Select the drive to checksum")?;
            let pb = ProgressBar::new(0);
            let digest = checksum::compute_device_checksum(
                backend,
                &drive,
                hash,
                |len| {
                    pb.set_length(len);
                    pb.set_prefix("Hashing");
                    pb.set_style(bar_style("green"));
                },
                |bytes| pb.set_position(bytes),
            );
            match digest {
                Ok(digest) => {
                    pb.finish_with_message("Done.");
                    println!("{hash}({}) = {digest}", backend.raw_device_path(&drive).display());
                }
                Err(e) => {
                    pb.abandon_with_message("❌ Operation failed.");
                    return Err(e.into());
                }
            }
        }
        Commands::LiveosChecksum { device, hash } => {
            let drive = resolve_drive(backend, device.as_deref(), "Select the drive to checksum")?;
            let was_mounted = drive.mount.is_some();
            let mount = backend
                .mount_device(&drive.key)
                .with_context(|| format!("mounting {}", drive.device.display()))?;
            let result = checksum::liveos_checksum(&mount, hash);
            if !was_mounted {
                backend.unmount_device(&drive.key)?;
            }
            let sum = result?;
            for (path, digest) in &sum.files {
                println!("{hash}({}) = {digest}", path.display());
            }
            println!("{hash} = {}", style(&sum.combined).green());
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<liveusb_core::Error>() {
                Some(core) => {
                    eprintln!("{} {}", style("Error:").red().bold(), core.short_message());
                    eprintln!("{e:#}");
                }
                None => eprintln!("{} {e:#}", style("Error:").red().bold()),
            }
            ExitCode::FAILURE
        }
    }
}

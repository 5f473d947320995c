//! Supervised execution of external tools.
//!
//! All bootloader, formatting, mounting and imaging work is delegated to
//! external programs. The [`Supervisor`] runs them, records every command line
//! and its output in an in-memory log, tracks the pid of each running child so
//! that [`Supervisor::terminate`] can interrupt a hung tool, and applies the
//! per-call [`ExitPolicy`].
use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// File name of the persisted failure log, written under the temp directory.
pub const LOG_FILE_NAME: &str = "liveusb-creator.log";

/// What to do when a command exits with a nonzero status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExitPolicy {
    /// A nonzero exit is an [`Error::ExternalTool`].
    #[default]
    Strict,
    /// A nonzero exit is logged and persisted, but the output is returned.
    /// Used for tools known to report failure on harmless conditions.
    Passive,
}

/// The captured result of a supervised command.
#[derive(Clone, Debug)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or -1 if the process was killed by a signal.
    pub code: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs external commands and keeps track of them.
///
/// One supervisor is owned by each device backend and shared (behind an
/// `Arc`) with whoever needs to cancel a run, e.g. a Ctrl+C handler.
#[derive(Debug)]
pub struct Supervisor {
    log: Mutex<String>,
    pids: Mutex<Vec<u32>>,
    cancelled: AtomicBool,
    log_path: PathBuf,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    /// Creates a supervisor persisting failures to the default log location.
    pub fn new() -> Self {
        Self::with_log_path(default_log_path())
    }

    pub fn with_log_path(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log: Mutex::new(String::new()),
            pids: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            log_path: log_path.into(),
        }
    }

    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }

    /// Runs `program` with `args`, capturing stdout and stderr.
    pub fn run<I, S>(&self, program: &str, args: I, policy: ExitPolicy) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let command_line = std::iter::once(program.to_string())
            .chain(args.iter().map(|a| a.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ");

        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }

        debug!("{command_line}");
        self.append_log(&format!("{command_line}\n"));

        let child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| {
                self.append_log(&format!("failed to spawn: {source}\n"));
                Error::ToolNotFound {
                    program: program.to_string(),
                    source,
                }
            })?;

        let pid = child.id();
        self.track(pid);
        let output = child.wait_with_output();
        self.untrack(pid);
        let output = output.map_err(|e| Error::io(format!("waiting for {program}"), e))?;

        let result = Output {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code().unwrap_or(-1),
        };
        self.append_log(&format!("{}\n{}\n", result.stdout, result.stderr));

        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if !result.success() {
            let log_file = self.write_log();
            match policy {
                ExitPolicy::Strict => {
                    return Err(Error::ExternalTool {
                        command: command_line,
                        status: result.code,
                        stderr: result.stderr.trim().to_string(),
                        log_file,
                    });
                }
                ExitPolicy::Passive => {
                    warn!(
                        "'{command_line}' exited with status {}; continuing",
                        result.code
                    );
                }
            }
        }

        Ok(result)
    }

    /// Signals every running child and cancels all further runs.
    pub fn terminate(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let pids = self.pids.lock().map(|p| p.clone()).unwrap_or_default();
        for pid in pids {
            match kill(pid) {
                Ok(()) => debug!("Killed process {pid}"),
                Err(e) => debug!("Unable to kill process {pid}: {e}"),
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clears the cancelled flag and the output log before a new run.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        if let Ok(mut log) = self.log.lock() {
            log.clear();
        }
    }

    /// Pids of children that are currently running.
    pub fn running_pids(&self) -> Vec<u32> {
        self.pids.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// The accumulated command output of this run.
    pub fn output_log(&self) -> String {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Appends the output log to the persisted log file and returns its path.
    ///
    /// Failure to write the file is only logged: the caller is already
    /// reporting a more important error.
    pub fn write_log(&self) -> PathBuf {
        let contents = self.output_log();
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut f| f.write_all(contents.as_bytes()));
        if let Err(e) = written {
            warn!("Unable to write {}: {e}", self.log_path.display());
        }
        self.log_path.clone()
    }

    fn append_log(&self, text: &str) {
        if let Ok(mut log) = self.log.lock() {
            log.push_str(text);
        }
    }

    fn track(&self, pid: u32) {
        if let Ok(mut pids) = self.pids.lock() {
            pids.push(pid);
        }
    }

    fn untrack(&self, pid: u32) {
        if let Ok(mut pids) = self.pids.lock() {
            pids.retain(|p| *p != pid);
        }
    }
}

/// `$TEMP/liveusb-creator.log`, falling back to the system temp directory.
pub fn default_log_path() -> PathBuf {
    std::env::var_os("TEMP")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(LOG_FILE_NAME)
}

#[cfg(unix)]
fn kill(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGHUP).map_err(std::io::Error::from)
}

#[cfg(windows)]
fn kill(pid: u32) -> std::io::Result<()> {
    let status = Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("taskkill exited with {status}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn supervisor() -> (tempfile::TempDir, Supervisor) {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::with_log_path(dir.path().join(LOG_FILE_NAME));
        (dir, sup)
    }

    #[test]
    fn captures_stdout_and_logs_command() {
        let (_dir, sup) = supervisor();
        let out = sup.run("echo", ["hello"], ExitPolicy::Strict).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");

        let log = sup.output_log();
        assert!(log.contains("echo hello"));
        assert!(log.contains("hello\n"));
    }

    #[test]
    fn strict_failure_writes_log_file() {
        let (_dir, sup) = supervisor();
        let err = sup
            .run("sh", ["-c", "echo oops >&2; exit 3"], ExitPolicy::Strict)
            .unwrap_err();
        match err {
            Error::ExternalTool {
                status,
                stderr,
                log_file,
                ..
            } => {
                assert_eq!(status, 3);
                assert_eq!(stderr, "oops");
                let persisted = std::fs::read_to_string(log_file).unwrap();
                assert!(persisted.contains("oops"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn passive_failure_is_swallowed_but_logged() {
        let (_dir, sup) = supervisor();
        let out = sup.run("false", [] as [&str; 0], ExitPolicy::Passive).unwrap();
        assert_eq!(out.code, 1);
        assert!(sup.log_path().exists());
    }

    #[test]
    fn missing_tool_is_reported() {
        let (_dir, sup) = supervisor();
        let err = sup
            .run("nonexistent_program_12345", [] as [&str; 0], ExitPolicy::Strict)
            .unwrap_err();
        assert!(matches!(err, Error::ToolNotFound { .. }));
    }

    #[test]
    fn terminate_interrupts_running_child() {
        let (_dir, sup) = supervisor();
        let sup = Arc::new(sup);
        let worker = {
            let sup = sup.clone();
            std::thread::spawn(move || sup.run("sleep", ["30"], ExitPolicy::Strict))
        };

        let start = Instant::now();
        while sup.running_pids().is_empty() && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
        }
        sup.terminate();

        let result = worker.join().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(20));
        assert!(sup.running_pids().is_empty());

        // Cancelled supervisors refuse new work until reset.
        assert!(matches!(
            sup.run("true", [] as [&str; 0], ExitPolicy::Strict),
            Err(Error::Cancelled)
        ));
        sup.reset();
        assert!(sup.run("true", [] as [&str; 0], ExitPolicy::Strict).is_ok());
    }
}

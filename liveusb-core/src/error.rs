//! Error types for the installation pipeline.
//!
//! Every variant carries enough context for a full diagnostic via `Display`,
//! and [`Error::short_message`] gives the one-line text a front-end shows to
//! the user.
use std::io;
use std::path::PathBuf;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A supervised command exited with a nonzero status.
    #[error(
        "There was a problem executing the following command: {command}\n{stderr}\nA more detailed error log has been written to '{}'",
        .log_file.display()
    )]
    ExternalTool {
        command: String,
        status: i32,
        stderr: String,
        log_file: PathBuf,
    },

    /// The command could not be spawned at all.
    #[error("Unable to execute '{program}': {source}. Is it installed?")]
    ToolNotFound {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Unable to mount {device}: {reason}")]
    Mount { device: String, reason: String },

    #[error("{device} is not mounted")]
    NotMounted { device: String },

    #[error("Unable to determine free space on {}: {reason}", .path.display())]
    FreeSpaceUnavailable { path: PathBuf, reason: String },

    #[error(
        "There is not enough free space on the selected device.\nRequired: {} MB. Free: {} MB.",
        .required / (1024 * 1024),
        .available / (1024 * 1024)
    )]
    InsufficientSpace { required: u64, available: u64 },

    /// The filesystem is missing or outside the accepted set.
    #[error("{}", unsupported_message(.fstype))]
    UnsupportedFilesystem { fstype: String },

    #[error(
        "The {algorithm} checksum of {} is invalid (expected {expected}, got {actual}). \
         Re-download the image, or run with --noverify to bypass this verification check.",
        .image.display()
    )]
    ChecksumMismatch {
        image: PathBuf,
        algorithm: String,
        expected: String,
        actual: String,
    },

    #[error("Cannot find device {0}")]
    DeviceNotFound(String),

    /// A pipeline step ran before the step it depends on.
    #[error("{0}")]
    Precondition(String),

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("Unable to read release catalog {}: {reason}", .path.display())]
    Catalog { path: PathBuf, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

fn unsupported_message(fstype: &str) -> String {
    if fstype.is_empty() {
        "Unknown filesystem. Your device may need to be reformatted.".to_string()
    } else {
        format!("Unsupported filesystem: {fstype}")
    }
}

impl Error {
    /// Wraps an I/O error with a description of what was being attempted.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// A short message suitable for a status line or dialog title.
    pub fn short_message(&self) -> String {
        match self {
            Error::ExternalTool { command, status, .. } => {
                let program = command.split_whitespace().next().unwrap_or(command);
                format!("{program} failed with exit status {status}")
            }
            Error::ToolNotFound { program, .. } => format!("{program} is not installed"),
            Error::Mount { device, .. } => format!("Unable to mount {device}"),
            Error::NotMounted { device } => format!("{device} is not mounted"),
            Error::FreeSpaceUnavailable { .. } => "Unable to determine free space".to_string(),
            Error::InsufficientSpace { .. } => "Not enough free space on device".to_string(),
            Error::UnsupportedFilesystem { fstype } => unsupported_message(fstype),
            Error::ChecksumMismatch { .. } => "Image checksum mismatch".to_string(),
            Error::DeviceNotFound(device) => format!("Cannot find device {device}"),
            Error::Precondition(msg) => msg.clone(),
            Error::Cancelled => "Cancelled".to_string(),
            Error::Catalog { .. } => "Invalid release catalog".to_string(),
            Error::Io { context, .. } => context.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_space_reports_megabytes() {
        let err = Error::InsufficientSpace {
            required: 800 * 1024 * 1024,
            available: 700 * 1024 * 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("Required: 800 MB"));
        assert!(msg.contains("Free: 700 MB"));
    }

    #[test]
    fn unknown_filesystem_suggests_reformat() {
        let err = Error::UnsupportedFilesystem {
            fstype: String::new(),
        };
        assert!(err.to_string().contains("reformatted"));

        let err = Error::UnsupportedFilesystem {
            fstype: "ntfs".into(),
        };
        assert_eq!(err.short_message(), "Unsupported filesystem: ntfs");
    }

    #[test]
    fn external_tool_short_message_names_program() {
        let err = Error::ExternalTool {
            command: "syslinux -d syslinux /dev/sdb1".into(),
            status: 1,
            stderr: "boom".into(),
            log_file: PathBuf::from("/tmp/liveusb-creator.log"),
        };
        assert_eq!(err.short_message(), "syslinux failed with exit status 1");
        assert!(err.to_string().contains("/tmp/liveusb-creator.log"));
    }
}

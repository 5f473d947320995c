//! Staging of compressed images.
//!
//! Images may be distributed as `.gz`, `.xz` or `.zst`. Extraction needs a
//! seekable ISO to loop-mount, so compressed images are first expanded to a
//! temporary file that lives as long as the [`StagedImage`].
use crate::error::{Error, Result};
use crate::process::Supervisor;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, info};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    /// Detects compression from the file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "gz" | "gzip" => Some(Self::Gzip),
            "xz" => Some(Self::Xz),
            "zst" | "zstd" => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// An image ready for extraction. If it had to be decompressed, the
/// temporary copy is deleted on drop.
#[derive(Debug)]
pub struct StagedImage {
    path: PathBuf,
    source: PathBuf,
    _temp_handle: Option<TempPath>,
}

impl StagedImage {
    /// The file to read the ISO from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file the caller selected.
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn is_decompressed(&self) -> bool {
        self._temp_handle.is_some()
    }

    /// Size of the ISO in bytes.
    pub fn size(&self) -> Result<u64> {
        std::fs::metadata(&self.path)
            .map(|m| m.len())
            .map_err(|e| Error::io(format!("reading size of {}", self.path.display()), e))
    }
}

impl AsRef<Path> for StagedImage {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Decompresses `input` to a temporary file if needed.
///
/// `on_progress` receives the decompressed byte total. Cancellation through
/// the supervisor stops the copy and removes the partial file.
pub fn stage_image<F>(input: &Path, supervisor: &Supervisor, mut on_progress: F) -> Result<StagedImage>
where
    F: FnMut(u64),
{
    let open = |e| Error::io(format!("opening {}", input.display()), e);
    let Some(compression) = Compression::from_path(input) else {
        if !input.is_file() {
            return Err(Error::Precondition(format!(
                "Image {} does not exist",
                input.display()
            )));
        }
        return Ok(StagedImage {
            path: input.to_path_buf(),
            source: input.to_path_buf(),
            _temp_handle: None,
        });
    };

    let input_file = BufReader::new(File::open(input).map_err(open)?);
    let mut reader: Box<dyn Read> = match compression {
        Compression::Gzip => Box::new(GzDecoder::new(input_file)),
        Compression::Xz => Box::new(XzDecoder::new(input_file)),
        Compression::Zstd => Box::new(ZstdDecoder::new(input_file).map_err(open)?),
    };

    info!("Decompressing {} ({compression:?})", input.display());
    let wrap = |e| Error::io(format!("decompressing {}", input.display()), e);
    let mut temp_file = NamedTempFile::new().map_err(wrap)?;
    {
        let mut writer = BufWriter::new(&mut temp_file);
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut total: u64 = 0;

        loop {
            if supervisor.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let n = reader.read(&mut buffer).map_err(wrap)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n]).map_err(wrap)?;
            total += n as u64;
            on_progress(total);
        }
        writer.flush().map_err(wrap)?;
        debug!("Decompressed {total} bytes");
    }

    let temp_path = temp_file.into_temp_path();
    Ok(StagedImage {
        path: temp_path.to_path_buf(),
        source: input.to_path_buf(),
        _temp_handle: Some(temp_path),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression as Level;
    use flate2::write::GzEncoder;

    fn supervisor(dir: &Path) -> Supervisor {
        Supervisor::with_log_path(dir.join("log"))
    }

    #[test]
    fn detects_compression_from_extension() {
        assert_eq!(Compression::from_path(Path::new("a.iso.gz")), Some(Compression::Gzip));
        assert_eq!(Compression::from_path(Path::new("a.iso.XZ")), Some(Compression::Xz));
        assert_eq!(Compression::from_path(Path::new("a.iso.zst")), Some(Compression::Zstd));
        assert_eq!(Compression::from_path(Path::new("a.iso")), None);
        assert_eq!(Compression::from_path(Path::new("image")), None);
    }

    #[test]
    fn plain_image_is_used_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("live.iso");
        std::fs::write(&iso, b"iso9660").unwrap();
        let staged = stage_image(&iso, &supervisor(dir.path()), |_| {}).unwrap();
        assert_eq!(staged.path(), iso);
        assert!(!staged.is_decompressed());
        assert_eq!(staged.size().unwrap(), 7);
    }

    #[test]
    fn missing_plain_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = stage_image(&dir.path().join("nope.iso"), &supervisor(dir.path()), |_| {});
        assert!(matches!(result, Err(Error::Precondition(_))));
    }

    #[test]
    fn gzip_image_is_expanded_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..3 * BUFFER_SIZE + 17).map(|i| (i % 253) as u8).collect();
        let gz = dir.path().join("live.iso.gz");
        let mut encoder = GzEncoder::new(File::create(&gz).unwrap(), Level::fast());
        encoder.write_all(&data).unwrap();
        encoder.finish().unwrap();

        let mut last = 0;
        let staged = stage_image(&gz, &supervisor(dir.path()), |n| last = n).unwrap();
        assert!(staged.is_decompressed());
        assert_eq!(staged.source(), gz);
        assert_eq!(last, data.len() as u64);
        assert_eq!(std::fs::read(staged.path()).unwrap(), data);

        let temp = staged.path().to_path_buf();
        drop(staged);
        assert!(!temp.exists());
    }

    #[test]
    fn cancellation_stops_decompression() {
        let dir = tempfile::tempdir().unwrap();
        let gz = dir.path().join("live.iso.gz");
        let mut encoder = GzEncoder::new(File::create(&gz).unwrap(), Level::fast());
        encoder.write_all(&[1u8; 4096]).unwrap();
        encoder.finish().unwrap();

        let supervisor = supervisor(dir.path());
        supervisor.terminate();
        assert!(matches!(stage_image(&gz, &supervisor, |_| {}), Err(Error::Cancelled)));
    }
}

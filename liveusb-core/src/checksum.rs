//! Streaming checksums over images, devices and installed payloads.
use crate::device::Drive;
use crate::error::{Error, Result};
use crate::platform::DeviceBackend;
use crate::release::ReleaseCatalog;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Chunk size used for image and device hashing.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Chunk size used for the LiveOS payload digest. Kept small for
/// compatibility with digests recorded by older releases of the tool.
pub const LIVEOS_CHUNK_SIZE: usize = 1024;

/// Files that make up an installed live payload, in digest order.
pub const LIVEOS_FILES: [&str; 5] = [
    "LiveOS/osmin.img",
    "LiveOS/squashfs.img",
    "syslinux/initrd0.img",
    "syslinux/vmlinuz0",
    "syslinux/isolinux.bin",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            _ => Err(format!("unknown hash algorithm: {s}")),
        }
    }
}

/// An in-progress digest for one of the supported algorithms.
pub struct Hasher(Inner);

enum Inner {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha1 => Self(Inner::Sha1(Sha1::new())),
            HashAlgorithm::Sha256 => Self(Inner::Sha256(Sha256::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.0 {
            Inner::Sha1(h) => h.update(data),
            Inner::Sha256(h) => h.update(data),
        }
    }

    /// Lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        match self.0 {
            Inner::Sha1(h) => hex::encode(h.finalize()),
            Inner::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Hashes everything `reader` yields, `chunk_size` bytes at a time.
///
/// `on_progress` receives the running byte total after every chunk.
pub fn hash_reader<R, F>(
    mut reader: R,
    algorithm: HashAlgorithm,
    chunk_size: usize,
    mut on_progress: F,
) -> io::Result<String>
where
    R: Read,
    F: FnMut(u64),
{
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0u8; chunk_size];
    let mut total: u64 = 0;
    loop {
        let n = read_chunk(&mut reader, &mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
        on_progress(total);
    }
    Ok(hasher.finalize_hex())
}

/// Fills `buf` as far as possible, so that chunks only come up short at EOF.
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// The outcome of checking an image against the release catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verification {
    Matched,
    Mismatched {
        algorithm: HashAlgorithm,
        expected: String,
        actual: String,
    },
    /// The image is not in the catalog; nothing was checked.
    Unknown,
}

/// Verifies an image against the checksum its catalog entry publishes.
///
/// `on_start` receives the image size in KiB when hashing begins, and
/// `on_progress` the KiB hashed so far.
pub fn verify_image_checksum<F>(
    image: &Path,
    catalog: &ReleaseCatalog,
    on_start: impl FnOnce(u64),
    mut on_progress: F,
) -> Result<Verification>
where
    F: FnMut(u64),
{
    let Some(expected) = catalog.lookup(image) else {
        debug!("Unknown image {}, skipping checksum verification", image.display());
        return Ok(Verification::Unknown);
    };

    let file = File::open(image).map_err(|e| Error::io(format!("opening {}", image.display()), e))?;
    let size = file
        .metadata()
        .map_err(|e| Error::io(format!("reading size of {}", image.display()), e))?
        .len();

    info!(
        "Verifying {} checksum of {} ({})",
        expected.algorithm, expected.release, expected.arch
    );
    on_start(size / 1024);
    let actual = hash_reader(file, expected.algorithm, CHUNK_SIZE, |bytes| {
        on_progress(bytes / 1024)
    })
    .map_err(|e| Error::io(format!("reading {}", image.display()), e))?;
    info!("{}({}) = {actual}", expected.algorithm, image.display());

    if actual.eq_ignore_ascii_case(&expected.digest) {
        Ok(Verification::Matched)
    } else {
        warn!(
            "The {} of {} is invalid: expected {}",
            expected.algorithm,
            image.display(),
            expected.digest
        );
        Ok(Verification::Mismatched {
            algorithm: expected.algorithm,
            expected: expected.digest,
            actual,
        })
    }
}

/// Hashes the whole disk a drive lives on, for post-write comparison.
///
/// `on_start` receives the device size in bytes, `on_progress` the bytes
/// hashed so far.
pub fn compute_device_checksum<F>(
    backend: &dyn DeviceBackend,
    drive: &Drive,
    algorithm: HashAlgorithm,
    on_start: impl FnOnce(u64),
    on_progress: F,
) -> Result<String>
where
    F: FnMut(u64),
{
    let path = backend.raw_device_path(drive);
    info!("Calculating the {algorithm} of {}", path.display());
    on_start(backend.raw_device_size(drive));

    let device = File::open(&path).map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
    let digest = hash_reader(device, algorithm, CHUNK_SIZE, on_progress)
        .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    info!("{algorithm}({}) = {digest}", path.display());
    Ok(digest)
}

/// Per-file digests of an installed payload and the digest over them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveOsChecksum {
    pub algorithm: HashAlgorithm,
    pub files: Vec<(PathBuf, String)>,
    pub combined: String,
}

/// Computes the diagnostic digest of an installed live payload.
///
/// Each file in [`LIVEOS_FILES`] is hashed separately, then the hex digests
/// are concatenated and hashed again. A missing file is an error.
pub fn liveos_checksum(mount: &Path, algorithm: HashAlgorithm) -> Result<LiveOsChecksum> {
    let mut files = Vec::with_capacity(LIVEOS_FILES.len());
    for relative in LIVEOS_FILES {
        let path = mount.join(relative);
        if !path.is_file() {
            return Err(Error::Precondition(format!(
                "Cannot calculate LiveOS checksum: {} is missing",
                path.display()
            )));
        }
        info!("Calculating the {algorithm} of {}", path.display());
        let file = File::open(&path).map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
        let digest = hash_reader(file, algorithm, LIVEOS_CHUNK_SIZE, |_| {})
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        info!("{algorithm}({}) = {digest}", path.display());
        files.push((path, digest));
    }

    let mut combined = Hasher::new(algorithm);
    for (_, digest) in &files {
        combined.update(digest.as_bytes());
    }
    let combined = combined.finalize_hex();
    info!("{algorithm} = {combined}");

    Ok(LiveOsChecksum {
        algorithm,
        files,
        combined,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::{Release, Variant};
    use std::collections::BTreeMap;
    use std::io::Cursor;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn chunking_does_not_change_digest() {
        let data = payload(3 * CHUNK_SIZE + 12345);
        for algorithm in [HashAlgorithm::Sha1, HashAlgorithm::Sha256] {
            let mut one_pass = Hasher::new(algorithm);
            one_pass.update(&data);
            let expected = one_pass.finalize_hex();

            let chunked = hash_reader(Cursor::new(&data), algorithm, CHUNK_SIZE, |_| {}).unwrap();
            let tiny = hash_reader(Cursor::new(&data), algorithm, LIVEOS_CHUNK_SIZE, |_| {}).unwrap();
            assert_eq!(chunked, expected);
            assert_eq!(tiny, expected);
        }
    }

    #[test]
    fn known_vectors() {
        let sha1 = hash_reader(Cursor::new(b"abc"), HashAlgorithm::Sha1, CHUNK_SIZE, |_| {}).unwrap();
        assert_eq!(sha1, "a9993e364706816aba3e25717850c26c9cd0d89d");
        let sha256 = hash_reader(Cursor::new(b"abc"), HashAlgorithm::Sha256, CHUNK_SIZE, |_| {}).unwrap();
        assert_eq!(
            sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn progress_is_reported_per_chunk() {
        let data = payload(2 * CHUNK_SIZE + 1);
        let mut seen = Vec::new();
        hash_reader(Cursor::new(&data), HashAlgorithm::Sha1, CHUNK_SIZE, |b| seen.push(b)).unwrap();
        assert_eq!(
            seen,
            vec![CHUNK_SIZE as u64, 2 * CHUNK_SIZE as u64, data.len() as u64]
        );
    }

    #[test]
    fn parses_algorithm_names() {
        assert_eq!("SHA256".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Sha256));
        assert_eq!("sha-1".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Sha1));
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }

    fn catalog_for(name: &str, sha256: &str) -> ReleaseCatalog {
        let mut variants = BTreeMap::new();
        variants.insert(
            "x86_64".to_string(),
            Variant {
                url: Some(format!("https://example.org/pub/{name}")),
                sha1: None,
                sha256: Some(sha256.to_string()),
            },
        );
        ReleaseCatalog::new(vec![Release {
            name: "Test".into(),
            variants,
        }])
    }

    #[test]
    fn image_verification_matches_and_mismatches() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("image.iso");
        let data = payload(CHUNK_SIZE + 100);
        std::fs::write(&image, &data).unwrap();

        let mut hasher = Hasher::new(HashAlgorithm::Sha256);
        hasher.update(&data);
        let digest = hasher.finalize_hex().to_uppercase();
        let catalog = catalog_for("image.iso", &digest);

        let mut max = 0;
        let mut last = 0;
        let result =
            verify_image_checksum(&image, &catalog, |m| max = m, |kib| last = kib).unwrap();
        assert_eq!(result, Verification::Matched);
        assert_eq!(max, data.len() as u64 / 1024);
        assert_eq!(last, max);

        let mut altered = data.clone();
        altered[500] ^= 0xff;
        std::fs::write(&image, &altered).unwrap();
        let result = verify_image_checksum(&image, &catalog, |_| {}, |_| {}).unwrap();
        assert!(matches!(result, Verification::Mismatched { .. }));
    }

    #[test]
    fn unknown_image_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("custom.iso");
        std::fs::write(&image, b"data").unwrap();
        let catalog = catalog_for("image.iso", "00");
        let mut started = false;
        let result = verify_image_checksum(&image, &catalog, |_| started = true, |_| {}).unwrap();
        assert_eq!(result, Verification::Unknown);
        assert!(!started);
    }

    #[test]
    fn liveos_checksum_combines_file_digests() {
        let dir = tempfile::tempdir().unwrap();
        for (i, file) in LIVEOS_FILES.iter().enumerate() {
            let path = dir.path().join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, payload(2048 + i)).unwrap();
        }

        let sum = liveos_checksum(dir.path(), HashAlgorithm::Sha1).unwrap();
        assert_eq!(sum.files.len(), LIVEOS_FILES.len());

        let mut expected = Hasher::new(HashAlgorithm::Sha1);
        for (_, digest) in &sum.files {
            expected.update(digest.as_bytes());
        }
        assert_eq!(sum.combined, expected.finalize_hex());
    }

    #[test]
    fn liveos_checksum_requires_every_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("LiveOS")).unwrap();
        std::fs::write(dir.path().join("LiveOS/squashfs.img"), b"x").unwrap();
        assert!(matches!(
            liveos_checksum(dir.path(), HashAlgorithm::Sha1),
            Err(Error::Precondition(_))
        ));
    }
}

//! The catalog of known published images.
//!
//! The catalog data is supplied by the caller as JSON:
//!
//! ```json
//! [
//!   {
//!     "name": "Fedora 23 Workstation",
//!     "variants": {
//!       "x86_64": { "url": "https://.../Fedora-Live-Workstation-x86_64-23-10.iso",
//!                   "sha256": "a91eca2492ac84909953ef27040f9b61d8525f7ec5e89f6430319f49f9f823fe" }
//!     }
//!   }
//! ]
//! ```
use crate::checksum::HashAlgorithm;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Variant {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl Variant {
    /// The last path segment of the download URL.
    pub fn file_name(&self) -> Option<&str> {
        let url = self.url.as_deref()?;
        let path = url.split(['?', '#']).next().unwrap_or(url);
        path.rsplit('/').next().filter(|name| !name.is_empty())
    }

    /// The expected digest, SHA-1 taking precedence over SHA-256.
    pub fn expected(&self) -> Option<(HashAlgorithm, &str)> {
        self.sha1
            .as_deref()
            .map(|h| (HashAlgorithm::Sha1, h))
            .or_else(|| self.sha256.as_deref().map(|h| (HashAlgorithm::Sha256, h)))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Release {
    pub name: String,
    #[serde(default)]
    pub variants: BTreeMap<String, Variant>,
}

/// The checksum a known image is expected to have.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpectedChecksum {
    pub release: String,
    pub arch: String,
    pub algorithm: HashAlgorithm,
    pub digest: String,
}

#[derive(Clone, Debug, Default)]
pub struct ReleaseCatalog {
    releases: Vec<Release>,
}

impl ReleaseCatalog {
    pub fn new(releases: Vec<Release>) -> Self {
        Self { releases }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::Catalog {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_json(&contents).map_err(|e| Error::Catalog {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json).map(Self::new)
    }

    pub fn releases(&self) -> &[Release] {
        &self.releases
    }

    /// Finds the catalog entry whose download file name equals the image's.
    ///
    /// Variants without a URL or without any checksum never match.
    pub fn lookup(&self, image: &Path) -> Option<ExpectedChecksum> {
        let image_name = image.file_name()?.to_str()?;
        self.releases.iter().find_map(|release| {
            release.variants.iter().find_map(|(arch, variant)| {
                if variant.file_name()? != image_name {
                    return None;
                }
                let (algorithm, digest) = variant.expected()?;
                Some(ExpectedChecksum {
                    release: release.name.clone(),
                    arch: arch.clone(),
                    algorithm,
                    digest: digest.to_string(),
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"[
        {"name": "Fedora 23 Workstation", "variants": {
            "x86_64": {"url": "https://dl.example.org/23/Fedora-Live-Workstation-x86_64-23-10.iso",
                       "sha256": "ABC123"},
            "i686": {"url": "https://dl.example.org/23/Fedora-Live-Workstation-i686-23-10.iso",
                     "sha1": "def456", "sha256": "ignored"}
        }},
        {"name": "Nightly", "variants": {"x86_64": {"url": "https://dl.example.org/nightly.iso"}}}
    ]"#;

    #[test]
    fn lookup_matches_base_name() {
        let catalog = ReleaseCatalog::from_json(CATALOG).unwrap();
        let found = catalog
            .lookup(Path::new("/home/me/Downloads/Fedora-Live-Workstation-x86_64-23-10.iso"))
            .unwrap();
        assert_eq!(found.release, "Fedora 23 Workstation");
        assert_eq!(found.arch, "x86_64");
        assert_eq!(found.algorithm, HashAlgorithm::Sha256);
        assert_eq!(found.digest, "ABC123");
    }

    #[test]
    fn sha1_takes_precedence() {
        let catalog = ReleaseCatalog::from_json(CATALOG).unwrap();
        let found = catalog
            .lookup(Path::new("Fedora-Live-Workstation-i686-23-10.iso"))
            .unwrap();
        assert_eq!(found.algorithm, HashAlgorithm::Sha1);
        assert_eq!(found.digest, "def456");
    }

    #[test]
    fn unknown_or_unhashed_images_do_not_match() {
        let catalog = ReleaseCatalog::from_json(CATALOG).unwrap();
        assert!(catalog.lookup(Path::new("custom.iso")).is_none());
        assert!(catalog.lookup(Path::new("nightly.iso")).is_none());
    }

    #[test]
    fn load_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("releases.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            ReleaseCatalog::load(&path),
            Err(Error::Catalog { .. })
        ));
    }
}

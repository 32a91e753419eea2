//! Manifest: a content-addressed view of a directory tree
//!
//! On disk the manifest is JSON:
//!
//! ```json
//! { "type": "dir", "files": { "a.text": { "type": "file", "md5": "e7df..." } } }
//! ```
//!
//! Both the local deploy directory and every remote host keep one. The
//! remote copy is the only record of what the host currently holds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use futures::future::{BoxFuture, FutureExt as _, try_join_all};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::hash::ContentDigest;

/// Default manifest file name, next to the staged directory
pub const MANIFEST_FILE: &str = "dirDigestMap.json";

/// One node of a manifest tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ManifestEntry {
    /// A regular file and the digest of its bytes
    #[serde(rename = "file")]
    File {
        #[serde(rename = "md5")]
        digest: ContentDigest,
    },
    /// A directory and its children, keyed by entry name
    #[serde(rename = "dir")]
    Directory {
        #[serde(rename = "files", default)]
        children: BTreeMap<String, ManifestEntry>,
    },
}

/// Errors produced while building, reading or writing a manifest
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest {origin}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize manifest")]
    Serialize(#[source] serde_json::Error),
    /// Entry names travel as JSON strings and remote shell arguments
    #[error("file name is not valid UTF-8: {}", .path.display())]
    NonUtf8Name { path: PathBuf },
}

impl ManifestEntry {
    /// Create a file node
    #[must_use]
    pub fn file(digest: ContentDigest) -> Self {
        Self::File { digest }
    }

    /// Create an empty directory node
    #[must_use]
    pub fn empty_dir() -> Self {
        Self::Directory {
            children: BTreeMap::new(),
        }
    }

    /// Create a directory node from `(name, entry)` pairs
    #[must_use]
    pub fn dir<I, S>(children: I) -> Self
    where
        I: IntoIterator<Item = (S, Self)>,
        S: Into<String>,
    {
        Self::Directory {
            children: children.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory { .. })
    }

    /// Look up a descendant by path segments
    #[must_use]
    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Option<&Self> {
        let mut node = self;
        for name in path {
            match node {
                Self::Directory { children } => node = children.get(name.as_ref())?,
                Self::File { .. } => return None,
            }
        }
        Some(node)
    }

    /// Number of file nodes in this subtree
    #[must_use]
    pub fn file_count(&self) -> usize {
        match self {
            Self::File { .. } => 1,
            Self::Directory { children } => children.values().map(Self::file_count).sum(),
        }
    }

    /// Parse the JSON manifest format
    ///
    /// `origin` names where the bytes came from and is only used in errors.
    pub fn from_json(bytes: &[u8], origin: &str) -> Result<Self, ManifestError> {
        serde_json::from_slice(bytes).map_err(|source| ManifestError::Parse {
            origin: origin.to_owned(),
            source,
        })
    }

    /// Serialize as pretty JSON with four-space indentation
    pub fn to_json_pretty(&self) -> Result<Vec<u8>, ManifestError> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut ser).map_err(ManifestError::Serialize)?;
        Ok(out)
    }

    /// Read a manifest file from the local filesystem
    pub async fn load(path: &Path) -> Result<Self, ManifestError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&bytes, &path.display().to_string())
    }

    /// Write a manifest file to the local filesystem
    pub async fn save(&self, path: &Path) -> Result<(), ManifestError> {
        tokio::fs::write(path, self.to_json_pretty()?)
            .await
            .map_err(|source| ManifestError::Io {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Build the manifest of a local directory tree
///
/// Regular files are hashed, directories are recursed into, everything else
/// (symlinks, sockets, devices) is left out. Siblings are processed
/// concurrently. Any I/O error or non-UTF-8 name aborts the whole build.
pub async fn build_manifest(root: &Path) -> Result<ManifestEntry, ManifestError> {
    build_dir(root.to_path_buf()).await
}

fn build_dir(dir: PathBuf) -> BoxFuture<'static, Result<ManifestEntry, ManifestError>> {
    async move {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ManifestError::Io { path, source }
        };

        let mut read_dir = tokio::fs::read_dir(&dir).await.map_err(io_err(&dir))?;
        let mut names = Vec::new();
        while let Some(entry) = read_dir.next_entry().await.map_err(io_err(&dir))? {
            names.push(entry.file_name());
        }

        let children = try_join_all(names.into_iter().map(|name| {
            let path = dir.join(&name);
            async move {
                let metadata = tokio::fs::symlink_metadata(&path)
                    .await
                    .map_err(io_err(&path))?;
                if !metadata.is_file() && !metadata.is_dir() {
                    trace!("skipping {}", path.display());
                    return Ok(None);
                }
                let name = name
                    .into_string()
                    .map_err(|_| ManifestError::NonUtf8Name { path: path.clone() })?;

                if metadata.is_file() {
                    let digest = ContentDigest::from_file(&path).await.map_err(io_err(&path))?;
                    trace!("hashed {} -> {digest}", path.display());
                    Ok(Some((name, ManifestEntry::file(digest))))
                } else {
                    Ok(Some((name, build_dir(path).await?)))
                }
            }
        }))
        .await?;

        Ok(ManifestEntry::Directory {
            children: children.into_iter().flatten().collect(),
        })
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn digest(hex: &str) -> ContentDigest {
        hex.parse().unwrap()
    }

    #[tokio::test]
    async fn test_build_nested_directory() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.text"), "a\n").unwrap();
        fs::write(dir.path().join("sub/b.text"), "b\n").unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();

        let manifest = build_manifest(dir.path()).await.unwrap();

        assert_eq!(
            manifest,
            ManifestEntry::dir([
                ("a.text", ManifestEntry::file(ContentDigest::from_bytes(b"a\n"))),
                ("empty", ManifestEntry::empty_dir()),
                (
                    "sub",
                    ManifestEntry::dir([(
                        "b.text",
                        ManifestEntry::file(ContentDigest::from_bytes(b"b\n"))
                    )])
                ),
            ])
        );
        assert_eq!(manifest.file_count(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_skips_symlinks() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("real.txt"), "real").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("loop")).unwrap();

        let manifest = build_manifest(dir.path()).await.unwrap();

        assert!(manifest.get(&["real.txt"]).is_some());
        assert!(manifest.get(&["link.txt"]).is_none());
        assert!(manifest.get(&["loop"]).is_none());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_build_rejects_non_utf8_name() {
        use std::os::unix::ffi::OsStrExt as _;

        let dir = TempDir::new().unwrap();
        let bad = dir.path().join(std::ffi::OsStr::from_bytes(b"caf\xe9.txt"));
        fs::write(&bad, "x").unwrap();

        let err = build_manifest(dir.path()).await.unwrap_err();
        match err {
            ManifestError::NonUtf8Name { path } => assert_eq!(path, bad),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_build_missing_root_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");

        let err = build_manifest(&missing).await.unwrap_err();
        match err {
            ManifestError::Io { path, .. } => assert_eq!(path, missing),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_wire_format() {
        let json = br#"{
            "type": "dir",
            "files": {
                "a.text": { "type": "file", "md5": "e7df7cd2ca07f4f1ab415d457a6e1c13" },
                "sub": {
                    "type": "dir",
                    "files": {
                        "b.text": { "type": "file", "md5": "341f9041b1ba9a11317cc6eb2bddb055" }
                    }
                }
            }
        }"#;

        let manifest = ManifestEntry::from_json(json, "test").unwrap();
        assert_eq!(
            manifest.get(&["sub", "b.text"]),
            Some(&ManifestEntry::file(digest("341f9041b1ba9a11317cc6eb2bddb055")))
        );
        assert_eq!(
            manifest.get(&["a.text"]),
            Some(&ManifestEntry::file(digest("e7df7cd2ca07f4f1ab415d457a6e1c13")))
        );
        assert!(manifest.get(&["a.text", "x"]).is_none());
    }

    #[test]
    fn test_serialize_uses_wire_names() {
        let manifest = ManifestEntry::dir([(
            "a.text",
            ManifestEntry::file(digest("e7df7cd2ca07f4f1ab415d457a6e1c13")),
        )]);

        let value: serde_json::Value =
            serde_json::from_slice(&manifest.to_json_pretty().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "dir",
                "files": {
                    "a.text": { "type": "file", "md5": "e7df7cd2ca07f4f1ab415d457a6e1c13" }
                }
            })
        );
    }

    #[test]
    fn test_parse_rejects_bad_digest() {
        let json = br#"{ "type": "dir", "files": { "a": { "type": "file", "md5": "xyz" } } }"#;
        let err = ManifestEntry::from_json(json, "remote:/srv/app/dirDigestMap.json").unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
        assert!(err.to_string().contains("remote:/srv/app/dirDigestMap.json"));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("x"), "x").unwrap();
        let manifest = build_manifest(dir.path()).await.unwrap();

        let path = dir.path().join(MANIFEST_FILE);
        manifest.save(&path).await.unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n    \"type\""), "four-space indent: {text}");
        assert_eq!(ManifestEntry::load(&path).await.unwrap(), manifest);
    }
}

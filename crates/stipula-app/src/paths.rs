//! Filesystem path helpers (XDG-aware) for LMDB state and blob buckets.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("unable to determine project directories")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid bucket name `{bucket}`; expected a non-empty slug without path separators")]
    InvalidBucket { bucket: String },
    #[error("invalid object key `{key}`; expected a non-empty name without path separators")]
    InvalidKey { key: String },
}

/// Container providing filesystem paths for the application. In production this is
/// rooted at `$XDG_DATA_HOME/stipula`; tests may construct custom instances.
#[derive(Debug, Clone)]
pub struct AppPaths {
    base_dir: PathBuf,
}

impl AppPaths {
    /// Construct paths rooted under `$XDG_DATA_HOME/stipula`.
    pub fn from_project_dirs() -> Result<Self, PathError> {
        let dirs =
            ProjectDirs::from("dev", "ribelo", "stipula").ok_or(PathError::MissingProjectDirs)?;
        Self::new(dirs.data_dir())
    }

    /// Construct paths rooted under the provided directory, ensuring it exists.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, PathError> {
        let base = base.as_ref().to_path_buf();
        ensure_dir(&base)?;
        Ok(Self { base_dir: base })
    }

    /// Base data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.clone()
    }

    /// LMDB environment directory for document and extraction rows
    /// (`.../lmdb/records`).
    pub fn records_lmdb_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["lmdb", "records"])
    }

    /// LMDB environment directory for pipeline runs (`.../lmdb/runs`).
    pub fn runs_lmdb_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["lmdb", "runs"])
    }

    /// Directory backing a blob bucket (`.../buckets/{bucket}`).
    pub fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, PathError> {
        validate_bucket(bucket)?;
        let segments = vec!["buckets".to_string(), normalize_slug(bucket)];
        self.ensure_dynamic(&segments)
    }

    /// Full path of an object within a bucket. The parent directory is
    /// created; the object itself may not exist yet.
    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, PathError> {
        validate_key(key)?;
        let mut path = self.bucket_dir(bucket)?;
        path.push(key);
        Ok(path)
    }

    fn ensure_child(&self, segments: &[&str]) -> Result<PathBuf, PathError> {
        let mut path = self.base_dir.clone();
        for segment in segments {
            path.push(segment);
        }
        ensure_dir(&path)
    }

    fn ensure_dynamic(&self, segments: &[String]) -> Result<PathBuf, PathError> {
        let mut path = self.base_dir.clone();
        for segment in segments {
            path.push(segment);
        }
        ensure_dir(&path)
    }
}

fn ensure_dir(path: &Path) -> Result<PathBuf, PathError> {
    if let Err(err) = fs::create_dir_all(path) {
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(PathError::CreateDir {
                path: path.to_path_buf(),
                source: err,
            });
        }
    }
    Ok(path.to_path_buf())
}

fn validate_bucket(bucket: &str) -> Result<(), PathError> {
    if bucket.trim().is_empty() || bucket.contains(['/', '\\']) || bucket.contains("..") {
        return Err(PathError::InvalidBucket {
            bucket: bucket.to_owned(),
        });
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), PathError> {
    if key.trim().is_empty() || key.contains(['/', '\\']) || key.contains("..") {
        return Err(PathError::InvalidKey {
            key: key.to_owned(),
        });
    }
    Ok(())
}

fn normalize_slug(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn object_path_lands_inside_bucket_dir() {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("app paths");

        let path = paths
            .object_path("uploads", "doc-1.pdf")
            .expect("object path");
        assert!(path.ends_with("buckets/uploads/doc-1.pdf"));
        assert!(path.parent().expect("parent dir").exists());
    }

    #[test]
    fn rejects_traversal_in_bucket_and_key() {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("app paths");

        assert!(matches!(
            paths.bucket_dir("../escape"),
            Err(PathError::InvalidBucket { .. })
        ));
        assert!(matches!(
            paths.object_path("uploads", "nested/key"),
            Err(PathError::InvalidKey { .. })
        ));
        assert!(matches!(
            paths.object_path("uploads", ""),
            Err(PathError::InvalidKey { .. })
        ));
    }
}

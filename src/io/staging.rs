//! Scratch directory of symlinks for the batch being basecalled.
//!
//! The basecaller pays a large fixed cost per invocation, so it is pointed at a
//! directory holding one batch of inputs. Symlinks avoid copying raw data.

use crate::error::{Error, Result};
use crate::io::SourceFile;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Staging directory owned for the lifetime of a run.
///
/// Dropping the value removes the directory and everything in it, so cleanup
/// happens on every exit path.
#[derive(Debug)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Create the staging directory. Fails if it already exists.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir(&dir).map_err(|source| Error::Setup {
            path: dir.clone(),
            source,
        })?;
        tracing::debug!("Created staging directory {}", dir.display());
        Ok(Self { dir })
    }

    /// Path of the staging directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Link every file of a batch into the staging directory.
    ///
    /// Files sharing a base name within the batch are kept apart by prefixing
    /// the later ones with a hash of their full path.
    pub fn stage(&self, files: &[SourceFile]) -> Result<()> {
        let mut used = HashSet::with_capacity(files.len());

        for file in files {
            let name = if used.contains(file.name.as_str()) {
                let prefixed = format!("{}-{}", path_digest(&file.path), file.name);
                tracing::warn!(
                    "Duplicate file name {} in batch, staging {} as {}",
                    file.name,
                    file.path.display(),
                    prefixed
                );
                prefixed
            } else {
                file.name.clone()
            };

            let link = self.dir.join(&name);
            symlink(&file.path, &link).map_err(|source| Error::Staging { link, source })?;
            used.insert(name);
        }

        Ok(())
    }

    /// Remove every entry inside the staging directory, keeping the directory.
    pub fn clear(&self) -> Result<()> {
        let entries = fs::read_dir(&self.dir).map_err(|source| Error::Io {
            operation: "list staging directory",
            path: self.dir.clone(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| Error::Io {
                operation: "list staging directory",
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();

            // file_type() does not follow symlinks
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let removed = if is_dir {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|source| Error::Staging { link: path, source })?;
        }

        Ok(())
    }

    /// Names currently present in the staging directory, sorted.
    pub fn entries(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.dir).map_err(|source| Error::Io {
            operation: "list staging directory",
            path: self.dir.clone(),
            source,
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| Error::Io {
                operation: "list staging directory",
                path: self.dir.clone(),
                source,
            })?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => tracing::debug!("Removed staging directory {}", self.dir.display()),
            Err(e) => tracing::warn!(
                "Failed to remove staging directory {}: {}",
                self.dir.display(),
                e
            ),
        }
    }
}

/// First 8 hex characters of the SHA-256 of a path.
fn path_digest(path: &Path) -> String {
    let digest = Sha256::digest(path.as_os_str().as_encoded_bytes());
    hex::encode(&digest[..4])
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(original, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source_files(root: &Path, names: &[&str]) -> Vec<SourceFile> {
        names
            .iter()
            .map(|name| {
                let path = root.join(name);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(&path, name.as_bytes()).unwrap();
                SourceFile::new(path).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_create_fails_if_directory_exists() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("staging");
        fs::create_dir(&dir).unwrap();

        let err = StagingArea::create(&dir).unwrap_err();
        assert!(matches!(err, Error::Setup { .. }));
    }

    #[test]
    fn test_stage_creates_links_to_sources() {
        let temp_dir = TempDir::new().unwrap();
        let files = source_files(temp_dir.path(), &["in/a.pod5", "in/b.pod5"]);
        let staging = StagingArea::create(temp_dir.path().join("staging")).unwrap();

        staging.stage(&files).unwrap();

        assert_eq!(staging.entries().unwrap(), vec!["a.pod5", "b.pod5"]);
        let link = staging.path().join("a.pod5");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&link).unwrap(), b"in/a.pod5");
    }

    #[test]
    fn test_clear_keeps_directory() {
        let temp_dir = TempDir::new().unwrap();
        let files = source_files(temp_dir.path(), &["a.pod5", "b.pod5"]);
        let staging = StagingArea::create(temp_dir.path().join("staging")).unwrap();
        staging.stage(&files).unwrap();
        fs::create_dir(staging.path().join("leftover")).unwrap();

        staging.clear().unwrap();

        assert!(staging.path().is_dir());
        assert!(staging.entries().unwrap().is_empty());
        // Link targets are untouched
        assert!(files.iter().all(|f| f.path.exists()));
    }

    #[test]
    fn test_restage_after_clear_has_only_new_batch() {
        let temp_dir = TempDir::new().unwrap();
        let files = source_files(temp_dir.path(), &["a.pod5", "b.pod5", "c.pod5"]);
        let staging = StagingArea::create(temp_dir.path().join("staging")).unwrap();

        staging.stage(&files[..2]).unwrap();
        staging.clear().unwrap();
        staging.stage(&files[2..]).unwrap();

        assert_eq!(staging.entries().unwrap(), vec!["c.pod5"]);
    }

    #[test]
    fn test_duplicate_names_in_batch_are_prefixed() {
        let temp_dir = TempDir::new().unwrap();
        let files = source_files(temp_dir.path(), &["run1/reads.pod5", "run2/reads.pod5"]);
        let staging = StagingArea::create(temp_dir.path().join("staging")).unwrap();

        staging.stage(&files).unwrap();

        let entries = staging.entries().unwrap();
        assert_eq!(entries.len(), 2);
        let prefixed = format!("{}-reads.pod5", path_digest(&files[1].path));
        assert!(entries.contains(&"reads.pod5".to_string()));
        assert!(entries.contains(&prefixed));
        assert_eq!(fs::read(staging.path().join(prefixed)).unwrap(), b"run2/reads.pod5");
    }

    #[test]
    fn test_stage_over_stale_link_fails() {
        let temp_dir = TempDir::new().unwrap();
        let files = source_files(temp_dir.path(), &["a.pod5"]);
        let staging = StagingArea::create(temp_dir.path().join("staging")).unwrap();

        staging.stage(&files).unwrap();
        let err = staging.stage(&files).unwrap_err();
        assert!(matches!(err, Error::Staging { .. }));
    }

    #[test]
    fn test_drop_removes_directory() {
        let temp_dir = TempDir::new().unwrap();
        let files = source_files(temp_dir.path(), &["a.pod5"]);
        let dir = temp_dir.path().join("staging");
        {
            let staging = StagingArea::create(&dir).unwrap();
            staging.stage(&files).unwrap();
        }
        assert!(!dir.exists());
        assert!(files[0].path.exists());
    }
}

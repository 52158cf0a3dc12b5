//! Discovery of raw-signal input files.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A raw-signal file found under the input root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Absolute path to the file
    pub path: PathBuf,

    /// Base file name, used as the staging link name
    pub name: String,
}

impl SourceFile {
    /// Build a source file from an absolute path.
    pub fn new(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_string();
        Some(Self { path, name })
    }
}

/// Recursively collect every regular file under `root` whose extension is `extension`.
///
/// Entries are visited in file-name order within each directory, so the result is
/// stable for a given tree. Paths are absolute so staging links resolve from any
/// directory. Unreadable entries are logged and skipped.
pub fn discover(root: &Path, extension: &str) -> Result<Vec<SourceFile>> {
    let root = root.canonicalize().map_err(|source| Error::Io {
        operation: "resolve input directory",
        path: root.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    let mut skipped = 0usize;

    for entry in WalkDir::new(&root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| match e {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::warn!("Skipping unreadable entry: {}", err);
                skipped += 1;
                None
            }
        })
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        let path = entry.into_path();
        match SourceFile::new(path.clone()) {
            Some(file) => files.push(file),
            None => tracing::warn!("Skipping {}: file name is not UTF-8", path.display()),
        }
    }

    if skipped > 0 {
        tracing::warn!("Skipped {} entries under {}", skipped, root.display());
    }

    if files.is_empty() {
        return Err(Error::NoInputFiles {
            root,
            extension: extension.to_string(),
        });
    }

    tracing::info!("Found {} .{} files under {}", files.len(), extension, root.display());
    Ok(files)
}

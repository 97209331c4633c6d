//! Dataset directory scanning
//!
//! Collects `(relative_path, size, mtime)` observations for the regular
//! tabular files under a dataset root. Observations feed the freshness
//! detector and the packager.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use ignore::WalkBuilder;
use ignore::overrides::OverrideBuilder;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// File extension recognized as tabular data
pub const TABULAR_EXTENSION: &str = "csv";

/// A single file observation from one scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileObservation {
    /// Relative path from the dataset root
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Raw modification time (not yet truncated)
    pub mtime: DateTime<Utc>,
}

/// Scanner for dataset directories
///
/// Only regular files with the recognized tabular extension are
/// reported. Files that cannot be stat'ed are logged and excluded;
/// an unreadable root is an error the caller decides how to absorb.
pub struct Scanner {
    root: PathBuf,
    extension: String,
}

impl Scanner {
    /// Create a scanner for the given dataset root
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: TABULAR_EXTENSION.to_string(),
        }
    }

    /// Override the recognized extension (without the leading dot)
    #[must_use]
    pub fn extension(mut self, ext: impl Into<String>) -> Self {
        self.extension = ext.into();
        self
    }

    /// Scan the dataset root and return all observations
    ///
    /// Output is sorted by relative path for deterministic ordering.
    ///
    /// # Errors
    /// Returns an error if the root is missing or cannot be traversed.
    pub fn scan(&self) -> Result<Vec<FileObservation>> {
        if !self.root.is_dir() {
            return Err(eyre!(
                "dataset root is not a readable directory: {}",
                self.root.display()
            ));
        }

        let mut overrides = OverrideBuilder::new(&self.root);
        overrides.add(&format!("*.{}", self.extension))?;

        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .overrides(overrides.build()?);

        let mut entries = Vec::new();

        for result in builder.build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("skipping unreadable entry: {e}");
                    continue;
                }
            };
            let path = entry.path();

            let is_file = entry.file_type().is_some_and(|t| t.is_file());
            if !is_file || !self.matches_extension(path.extension()) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("cannot stat {}: {e}", path.display());
                    continue;
                }
            };
            let modified = match metadata.modified() {
                Ok(m) => m,
                Err(e) => {
                    warn!("no modification time for {}: {e}", path.display());
                    continue;
                }
            };

            let relative_path = path.strip_prefix(&self.root)?.to_path_buf();

            entries.push(FileObservation {
                path: relative_path,
                size: metadata.len(),
                mtime: DateTime::<Utc>::from(modified),
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(entries)
    }

    fn matches_extension(&self, ext: Option<&std::ffi::OsStr>) -> bool {
        ext.and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.extension))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    #[test]
    fn test_scan_only_tabular_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.csv"), "x,y\n1,2\n").unwrap();
        fs::write(dir.path().join("b.csv"), "x,y\n3,4\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();
        fs::write(dir.path().join("data.json"), "{}").unwrap();

        let entries = Scanner::new(dir.path()).scan().unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, Path::new("a.csv"));
        assert_eq!(entries[1].path, Path::new("b.csv"));
    }

    #[test]
    fn test_scan_nested_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        fs::write(dir.path().join("root.csv"), "a\n").unwrap();
        fs::write(dir.path().join("sub/nested.csv"), "b\n").unwrap();
        fs::write(dir.path().join("sub/deep/leaf.csv"), "c\n").unwrap();

        let entries = Scanner::new(dir.path()).scan().unwrap();
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn test_scan_extension_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("UPPER.CSV"), "a\n").unwrap();

        let entries = Scanner::new(dir.path()).scan().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_scan_missing_root_is_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");

        assert!(Scanner::new(&missing).scan().is_err());
    }

    #[test]
    fn test_scan_empty_directory() {
        let dir = TempDir::new().unwrap();
        let entries = Scanner::new(dir.path()).scan().unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_scan_records_size() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("t.csv"), "12345").unwrap();

        let entries = Scanner::new(dir.path()).scan().unwrap();
        assert_eq!(entries[0].size, 5);
    }
}

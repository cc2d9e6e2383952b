//! Discovery of candidate files under the input directory.
//!
//! The same [`ScanFilter`] decides both for the full startup walk and for
//! paths reported by the live watcher, so the two ingest paths always agree.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Which paths under the input root are eligible for ingestion.
#[derive(Debug, Clone)]
pub struct ScanFilter {
    root: PathBuf,
    output_dir: PathBuf,
    /// Lowercase extensions without the leading dot; empty accepts all.
    extensions: Vec<String>,
}

impl ScanFilter {
    pub fn new(root: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            root: root.into(),
            output_dir: output_dir.into(),
            extensions: extensions
                .iter()
                .map(|e| e.trim().trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a directory's contents should be skipped entirely.
    ///
    /// Hidden directories below the root and the output directory (when it
    /// is nested in the input tree) are skipped.
    pub fn skips_dir(&self, dir: &Path) -> bool {
        dir.starts_with(&self.output_dir) || self.has_hidden_component(dir)
    }

    /// Whether a path, file or directory, lies outside the tracked tree.
    ///
    /// Unlike [`ScanFilter::accepts`] this ignores the extension list, so it
    /// can be applied to watcher paths before knowing what they point at.
    pub fn is_excluded(&self, path: &Path) -> bool {
        !path.starts_with(&self.root) || self.skips_dir(path)
    }

    /// Whether a file path should be tracked.
    pub fn accepts(&self, path: &Path) -> bool {
        !self.is_excluded(path) && self.has_allowed_extension(path)
    }

    fn has_allowed_extension(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    // Checked relative to the root so a root like `/home/u/.media` still works.
    fn has_hidden_component(&self, path: &Path) -> bool {
        let rel = match path.strip_prefix(&self.root) {
            Ok(rel) => rel,
            Err(_) => return false,
        };
        rel.components().any(|c| {
            c.as_os_str()
                .to_str()
                .map(|name| name.starts_with('.'))
                .unwrap_or(false)
        })
    }
}

/// Recursively list every accepted file beneath `dir`.
///
/// `dir` is usually the filter's root, but the watcher also passes a newly
/// created subdirectory. Unreadable entries are skipped.
pub fn scan_dir(dir: &Path, filter: &ScanFilter) -> Vec<PathBuf> {
    if !dir.exists() {
        return Vec::new();
    }

    let walker = WalkDir::new(dir).into_iter().filter_entry(|entry| {
        // The starting directory itself is always walked.
        !(entry.depth() > 0 && entry.file_type().is_dir() && filter.skips_dir(entry.path()))
    });

    walker
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| filter.accepts(path))
        .collect()
}

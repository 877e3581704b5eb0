//! Test file discovery

use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use walkdir::{DirEntry, WalkDir};

use crate::error::RunnerError;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Finds test files below a root directory.
#[derive(Debug, Clone)]
pub struct Discovery {
    root: PathBuf,
    patterns: Vec<Pattern>,
    ignore: Vec<String>,
    filter: Option<String>,
}

impl Discovery {
    /// `patterns` are globs over root-relative paths; `ignore` entries are
    /// substrings that exclude a path.
    pub fn new(
        root: impl Into<PathBuf>,
        patterns: &[String],
        ignore: &[String],
    ) -> Result<Self, RunnerError> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                Pattern::new(pattern).map_err(|source| RunnerError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            root: root.into(),
            patterns,
            ignore: ignore.to_vec(),
            filter: None,
        })
    }

    /// Only keep paths containing `filter`.
    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter;
        self
    }

    /// Whether `path` (relative to the root) is a test file.
    pub fn is_test_file(&self, path: &Path) -> bool {
        let display = path.to_string_lossy();
        if self.ignore.iter().any(|i| display.contains(i.as_str())) {
            return false;
        }
        if let Some(filter) = &self.filter {
            if !display.contains(filter.as_str()) {
                return false;
            }
        }
        self.patterns
            .iter()
            .any(|pattern| pattern.matches_path_with(path, MATCH_OPTIONS))
    }

    /// Matching files in walk order (sorted by file name at every level).
    /// The walk is lazy; unreadable entries are skipped.
    pub fn files(self) -> impl Iterator<Item = PathBuf> {
        WalkDir::new(self.root.clone())
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_skipped_dir(e))
            .filter_map(|e| match e {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::debug!(error = %err, "skipping unreadable entry");
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .filter_map(move |e| {
                let matched = self.is_test_file(e.path().strip_prefix(&self.root).ok()?);
                matched.then(|| e.into_path())
            })
    }
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_str().unwrap_or("");
    name.starts_with('.') || name == "node_modules" || name == "target"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn patterns() -> Vec<String> {
        vec!["**/*.test.*".to_string(), "**/*_test.*".to_string()]
    }

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    fn relative(root: &Path, files: Vec<PathBuf>) -> Vec<String> {
        files
            .into_iter()
            .map(|f| f.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn test_finds_matching_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "b.test.json");
        touch(root, "a.test.json");
        touch(root, "sub/c_test.json");
        touch(root, "readme.md");
        touch(root, ".hidden/d.test.json");
        touch(root, "node_modules/pkg/e.test.json");

        let discovery = Discovery::new(root, &patterns(), &[]).unwrap();
        let files: Vec<_> = discovery.files().collect();
        assert_eq!(
            relative(root, files),
            ["a.test.json", "b.test.json", "sub/c_test.json"]
        );
    }

    #[test]
    fn test_ignore_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "math/add.test.json");
        touch(root, "math/sub.test.json");
        touch(root, "slow/big.test.json");

        let discovery = Discovery::new(root, &patterns(), &["slow/".to_string()])
            .unwrap()
            .with_filter(Some("add".to_string()));
        let files: Vec<_> = discovery.files().collect();
        assert_eq!(relative(root, files), ["math/add.test.json"]);
    }

    #[test]
    fn test_invalid_pattern() {
        let err = Discovery::new(".", &["[".to_string()], &[]).unwrap_err();
        assert!(matches!(err, RunnerError::Pattern { .. }));
    }
}

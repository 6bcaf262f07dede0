//! Resolution of glob-style source patterns into concrete files.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{EtlError, Result};

/// A root directory plus a relative pattern such as `song_data/*/*/*/*.json`.
///
/// Each `/`-separated pattern component matches exactly one path component.
/// Within a component `*` matches any run of characters and `?` matches one
/// character. There is no recursive `**`. A name starting with `.` or `_`
/// only matches a pattern component that starts with the same character, so
/// wildcards never pick up `_SUCCESS` markers or dotfiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePattern {
    pub root: PathBuf,
    pub pattern: String,
}

impl SourcePattern {
    pub fn new(root: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            pattern: pattern.into(),
        }
    }

    fn components(&self) -> Vec<&str> {
        self.pattern
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .collect()
    }

    /// Return every regular file matching the pattern, sorted by path.
    ///
    /// Fails with [`EtlError::NoSourceFiles`] when nothing matches, including
    /// when the root does not exist.
    pub fn resolve(&self) -> Result<Vec<PathBuf>> {
        let components = self.components();
        if components.is_empty() {
            return Err(EtlError::NoSourceFiles {
                pattern: self.to_string(),
            });
        }
        let depth = components.len();

        let mut files = Vec::new();
        if self.root.is_dir() {
            let walker = WalkDir::new(&self.root)
                .min_depth(depth)
                .max_depth(depth)
                .follow_links(true)
                .sort_by_file_name();
            for entry in walker {
                let entry = entry.map_err(|e| EtlError::SourceRead {
                    pattern: self.to_string(),
                    reason: e.to_string(),
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if path_matches(&self.root, entry.path(), &components) {
                    files.push(entry.into_path());
                }
            }
        }

        if files.is_empty() {
            return Err(EtlError::NoSourceFiles {
                pattern: self.to_string(),
            });
        }
        files.sort();
        debug!("Resolved {} to {} files", self, files.len());
        Ok(files)
    }
}

impl fmt::Display for SourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root.join(&self.pattern).display())
    }
}

fn path_matches(root: &Path, path: &Path, components: &[&str]) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    let parts: Vec<_> = relative.components().collect();
    parts.len() == components.len()
        && parts.iter().zip(components).all(|(part, pattern)| {
            part.as_os_str().to_str().is_some_and(|name| {
                !is_hidden_from(pattern, name) && wildcard_match(pattern, name)
            })
        })
}

/// Whether `name` is a hidden or bookkeeping entry that `pattern` does not
/// name explicitly.
fn is_hidden_from(pattern: &str, name: &str) -> bool {
    match name.chars().next() {
        Some(lead @ ('.' | '_')) => !pattern.starts_with(lead),
        _ => false,
    }
}

/// Match `name` against a single-component pattern with `*` and `?`.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();

    let (mut p, mut n) = (0usize, 0usize);
    // Position of the last `*` seen and the name index it was tried against.
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, n));
            p += 1;
        } else if let Some((star, tried)) = backtrack {
            p = star + 1;
            n = tried + 1;
            backtrack = Some((star, tried + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

//! `fnmatch`-style ignore pattern loading and evaluation, used by the
//! indexer to prune both directories and files from a share scan.

use std::path::Path;

use globset::{Glob, GlobMatcher};

/// A compiled set of ignore patterns, evaluated `fnmatch`-style: each
/// pattern is matched against the full POSIX-relative path with no
/// special treatment of `/` (wildcards cross directory boundaries, as
/// `fnmatch.fnmatch` does).
pub struct IgnoreSet {
    matchers: Vec<GlobMatcher>,
}

impl IgnoreSet {
    pub fn new(patterns: impl IntoIterator<Item = String>) -> Self {
        let matchers = patterns
            .into_iter()
            .filter_map(|pat| Glob::new(&pat).ok())
            .map(|g| g.compile_matcher())
            .collect();
        Self { matchers }
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// Match `rel_path` (POSIX form, no leading `/`) against every pattern,
    /// trying both the plain form and a trailing-slash form so directory
    /// patterns like `build/` match the directory itself.
    pub fn is_ignored(&self, rel_path: &str) -> bool {
        if self.matchers.iter().any(|m| m.is_match(rel_path)) {
            return true;
        }
        if !rel_path.ends_with('/') {
            let with_slash = format!("{rel_path}/");
            if self.matchers.iter().any(|m| m.is_match(&with_slash)) {
                return true;
            }
        }
        false
    }
}

/// Read a `.keymeshignore`-shaped file: one pattern per line, blank lines
/// and `#`-prefixed comments ignored.
pub fn load_ignore_patterns(path: &Path) -> std::io::Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(parse_ignore_patterns(&contents))
}

pub fn parse_ignore_patterns(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_skipping_blanks_and_comments() {
        let text = "build/\n\n# comment\n*.tmp\n";
        assert_eq!(parse_ignore_patterns(text), vec!["build/", "*.tmp"]);
    }

    #[test]
    fn matches_directory_pattern_without_trailing_slash_in_path() {
        let set = IgnoreSet::new(vec!["build/".to_string()]);
        assert!(set.is_ignored("build"));
        assert!(set.is_ignored("build/"));
        assert!(!set.is_ignored("src/build.rs"));
    }

    #[test]
    fn wildcard_crosses_directory_boundaries_like_fnmatch() {
        let set = IgnoreSet::new(vec!["*.o".to_string()]);
        assert!(set.is_ignored("obj/x.o"));
    }
}

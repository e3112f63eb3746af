//! Path allowlist built from glob patterns.
//!
//! `*` matches within one path segment and `**` matches across segments.

use anyhow::{Context, Result, anyhow};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Compiled set of allow globs matched against `/`-separated relative paths.
#[derive(Debug, Clone)]
pub struct AllowList {
    set: GlobSet,
}

impl AllowList {
    /// Compile `patterns`. Errors on an empty list or an invalid glob.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        if patterns.is_empty() {
            return Err(anyhow!("allowlist must contain at least one glob"));
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .with_context(|| format!("invalid allow glob '{pattern}'"))?;
            builder.add(glob);
        }
        let set = builder.build().context("build allowlist glob set")?;
        Ok(Self { set })
    }

    /// True if `path` matches at least one pattern.
    pub fn matches(&self, path: &str) -> bool {
        self.set.is_match(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_star_crosses_segments() {
        let allow = AllowList::new(&["src/**"]).expect("allowlist");
        assert!(allow.matches("src/app.ts"));
        assert!(allow.matches("src/deep/nested/app.ts"));
        assert!(!allow.matches("tests/app.ts"));
    }

    #[test]
    fn single_star_stays_within_segment() {
        let allow = AllowList::new(&["src/*.ts"]).expect("allowlist");
        assert!(allow.matches("src/app.ts"));
        assert!(!allow.matches("src/nested/app.ts"));
    }

    #[test]
    fn bare_double_star_matches_everything() {
        let allow = AllowList::new(&["**"]).expect("allowlist");
        assert!(allow.matches(".env"));
        assert!(allow.matches("a/b/c.rs"));
    }

    #[test]
    fn empty_allowlist_is_rejected() {
        let patterns: Vec<String> = Vec::new();
        let err = AllowList::new(&patterns).unwrap_err();
        assert!(err.to_string().contains("at least one glob"));
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let err = AllowList::new(&["src/[ab"]).unwrap_err();
        assert!(err.to_string().contains("invalid allow glob"));
    }
}

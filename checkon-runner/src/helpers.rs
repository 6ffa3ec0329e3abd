// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for checkon-runner.

use std::fmt;
use swrite::{SWrite, swrite};
use xxhash_rust::xxh3::xxh3_64;

/// Utilities for pluralizing various words based on count.
pub mod plural {
    /// Returns "project" if `count` is 1, otherwise "projects".
    pub fn projects_str(count: usize) -> &'static str {
        if count == 1 { "project" } else { "projects" }
    }

    /// Returns "environment" if `count` is 1, otherwise "environments".
    pub fn environments_str(count: usize) -> &'static str {
        if count == 1 {
            "environment"
        } else {
            "environments"
        }
    }

    /// Returns "test" if `count` is 1, otherwise "tests".
    pub fn tests_str(count: usize) -> &'static str {
        if count == 1 { "test" } else { "tests" }
    }
}

/// Displays an optional exit code, where `None` means the process was killed by a signal.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DisplayExitCode(pub(crate) Option<i32>);

impl fmt::Display for DisplayExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("a signal"),
        }
    }
}

/// Displays captured standard error indented below a message, or nothing if it is blank.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DisplayStderr<'a>(pub(crate) &'a str);

impl fmt::Display for DisplayStderr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stderr = self.0.trim_end();
        if stderr.trim().is_empty() {
            return Ok(());
        }
        f.write_str(":")?;
        for line in stderr.lines() {
            write!(f, "\n  {line}")?;
        }
        Ok(())
    }
}

/// Maximum length of the readable part of a slug.
const MAX_SLUG_PREFIX_LEN: usize = 48;

/// Turns arbitrary text (typically a URL) into a short directory-safe name.
///
/// The readable prefix keeps ASCII alphanumerics, `-` and `_`, with everything else mapped to
/// `_`. A hash of the full text is always appended so that distinct inputs never collide.
pub(crate) fn slugify(text: &str) -> String {
    let trimmed = text
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .trim_end_matches(".git");

    let mut slug: String = trimmed
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .take(MAX_SLUG_PREFIX_LEN)
        .collect();
    let hash = xxh3_64(text.as_bytes());
    swrite!(slug, "-{:08x}", hash & 0xFFFF_FFFF);
    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("https://github.com/python-attrs/attrs", "github_com_python-attrs_attrs" ; "https")]
    #[test_case("https://github.com/a/b.git", "github_com_a_b" ; "dot git")]
    #[test_case("git@github.com:a/b", "git_github_com_a_b" ; "scp style")]
    fn slug_prefix(input: &str, prefix: &str) {
        let slug = slugify(input);
        let (head, hash) = slug.rsplit_once('-').expect("slug has a hash suffix");
        assert_eq!(head, prefix);
        assert_eq!(hash.len(), 8);
    }

    #[test]
    fn slugs_of_similar_urls_differ() {
        assert_ne!(
            slugify("https://example.com/a/b"),
            slugify("https://example.com/a_b")
        );
    }

    #[test]
    fn long_slug_is_truncated() {
        let url = format!("https://example.com/{}", "x".repeat(200));
        assert_eq!(slugify(&url).len(), MAX_SLUG_PREFIX_LEN + 9);
    }
}

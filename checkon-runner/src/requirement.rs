// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Injected requirements: classification and resolution into an installable argument.

use crate::errors::RequirementResolveError;
use camino::Utf8Path;
use regex::Regex;
use std::{fmt, sync::LazyLock};

// A PEP 508 requirement without a direct reference: name, optional extras, optional version
// specifiers, optional environment marker.
static NAMED_REQUIREMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^
        [A-Za-z0-9] (?: [A-Za-z0-9._-]* [A-Za-z0-9] )?
        (?: \s* \[ [A-Za-z0-9._,\s-]* \] )?
        \s*
        (?:
            \(?
            (?: ===|==|!=|~=|<=|>=|<|> ) \s* [A-Za-z0-9.*+!_-]+
            (?: \s* , \s* (?: ===|==|!=|~=|<=|>=|<|> ) \s* [A-Za-z0-9.*+!_-]+ )*
            \)?
        )?
        \s*
        (?: ; .* )?
        $
        ",
    )
    .expect("named requirement regex is valid")
});

const VCS_PREFIXES: &[&str] = &["git+", "hg+", "svn+", "bzr+"];

/// How an injected requirement was interpreted.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RequirementKind {
    /// A distribution name with optional version specifiers, for example `attrs==19.2.0`.
    Named,
    /// A URL, including VCS URLs such as `git+https://...`.
    Remote,
    /// A local path, stored in absolute canonical form.
    Path,
}

/// A requirement to force-install into every environment, resolved into the exact argument the
/// installer receives.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Requirement {
    original: String,
    kind: RequirementKind,
    editable: bool,
    target: String,
    install_arg: String,
}

impl Requirement {
    /// Classifies `input` and resolves it into an installable argument.
    ///
    /// Relative paths are resolved against `cwd` and must exist. Resolution happens once, before
    /// anything runs, so every environment receives the same argument.
    pub fn resolve(input: &str, cwd: &Utf8Path) -> Result<Self, RequirementResolveError> {
        let original = input.trim();
        if original.is_empty() {
            return Err(RequirementResolveError::Empty);
        }

        let (editable, value) = match strip_editable(original) {
            Some(rest) => (true, rest),
            None => (false, original),
        };

        if is_remote(value) {
            return Ok(Self {
                original: original.to_owned(),
                kind: RequirementKind::Remote,
                editable,
                target: value.to_owned(),
                install_arg: original.to_owned(),
            });
        }

        // `-e name` is never a valid named requirement, so an editable local value is always a
        // path.
        if !editable && NAMED_REQUIREMENT.is_match(value) {
            return Ok(Self {
                original: original.to_owned(),
                kind: RequirementKind::Named,
                editable,
                target: value.to_owned(),
                install_arg: original.to_owned(),
            });
        }

        let joined = cwd.join(value);
        let path = joined.canonicalize_utf8().map_err(|err| {
            RequirementResolveError::PathNotFound {
                input: original.to_owned(),
                path: joined.clone(),
                err,
            }
        })?;
        let install_arg = if editable {
            format!("-e {path}")
        } else {
            path.to_string()
        };
        Ok(Self {
            original: original.to_owned(),
            kind: RequirementKind::Path,
            editable,
            target: path.into_string(),
            install_arg,
        })
    }

    /// The text the requirement was given as.
    pub fn original(&self) -> &str {
        &self.original
    }

    /// How the requirement was interpreted.
    pub fn kind(&self) -> RequirementKind {
        self.kind
    }

    /// True if the requirement is installed in editable mode.
    pub fn is_editable(&self) -> bool {
        self.editable
    }

    /// The exact argument passed to the installer.
    pub fn install_arg(&self) -> &str {
        &self.install_arg
    }

    /// The installer arguments, one per shell word: `-e` followed by the target for editable
    /// requirements, otherwise just the target.
    pub fn install_args(&self) -> Vec<&str> {
        if self.editable {
            vec!["-e", self.target.as_str()]
        } else {
            vec![self.target.as_str()]
        }
    }

    /// For path requirements, the resolved path.
    pub fn path(&self) -> Option<&Utf8Path> {
        match self.kind {
            RequirementKind::Path => Some(Utf8Path::new(&self.target)),
            RequirementKind::Named | RequirementKind::Remote => None,
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.install_arg)
    }
}

fn strip_editable(input: &str) -> Option<&str> {
    ["-e ", "--editable ", "--editable="]
        .iter()
        .find_map(|prefix| input.strip_prefix(prefix))
        .map(str::trim_start)
}

fn is_remote(value: &str) -> bool {
    value.contains("://") || VCS_PREFIXES.iter().any(|prefix| value.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("attrs" ; "bare name")]
    #[test_case("attrs==19.2.0" ; "pinned")]
    #[test_case("attrs >= 19.1, < 20" ; "range")]
    #[test_case("requests[security,socks]~=2.22" ; "extras")]
    #[test_case("pytest_cov==2.8.1; python_version >= '3.5'" ; "marker")]
    fn named_requirements_pass_through(input: &str) {
        let dir = Utf8TempDir::new().unwrap();
        let requirement = Requirement::resolve(input, dir.path()).expect("named resolves");
        assert_eq!(requirement.kind(), RequirementKind::Named);
        assert_eq!(requirement.install_arg(), input);
        assert_eq!(requirement.path(), None);
    }

    #[test_case("https://example.com/attrs-19.2.0.tar.gz", false ; "https archive")]
    #[test_case("git+https://github.com/python-attrs/attrs@main#egg=attrs", false ; "vcs")]
    #[test_case("attrs @ https://example.com/attrs.whl", false ; "direct reference")]
    #[test_case("-e git+https://github.com/python-attrs/attrs#egg=attrs", true ; "editable vcs")]
    fn remote_requirements_pass_through(input: &str, editable: bool) {
        let dir = Utf8TempDir::new().unwrap();
        let requirement = Requirement::resolve(input, dir.path()).expect("remote resolves");
        assert_eq!(requirement.kind(), RequirementKind::Remote);
        assert_eq!(requirement.is_editable(), editable);
        assert_eq!(requirement.install_arg(), input);
    }

    #[test]
    fn relative_path_becomes_absolute() {
        let dir = Utf8TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("widget")).unwrap();
        let canonical = dir.path().join("widget").canonicalize_utf8().unwrap();

        let requirement = Requirement::resolve("./widget", dir.path()).expect("path resolves");
        assert_eq!(requirement.kind(), RequirementKind::Path);
        assert!(!requirement.is_editable());
        assert_eq!(requirement.install_arg(), canonical.as_str());
        assert_eq!(requirement.path(), Some(canonical.as_path()));
        assert_eq!(requirement.install_args(), [canonical.as_str()]);

        let editable = Requirement::resolve("-e widget", dir.path()).expect("editable resolves");
        assert_eq!(editable.kind(), RequirementKind::Path);
        assert!(editable.is_editable());
        assert_eq!(editable.install_arg(), format!("-e {canonical}"));
        assert_eq!(editable.path(), Some(canonical.as_path()));
        assert_eq!(editable.install_args(), ["-e", canonical.as_str()]);
        assert_eq!(editable.original(), "-e widget");
    }

    #[test]
    fn missing_path_is_an_error() {
        let dir = Utf8TempDir::new().unwrap();
        let err = Requirement::resolve("../does/not/exist", dir.path()).expect_err("missing");
        assert!(
            matches!(err, RequirementResolveError::PathNotFound { .. }),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn empty_is_an_error() {
        let dir = Utf8TempDir::new().unwrap();
        assert!(matches!(
            Requirement::resolve("  ", dir.path()),
            Err(RequirementResolveError::Empty)
        ));
    }
}

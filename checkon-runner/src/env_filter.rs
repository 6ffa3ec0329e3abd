// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Selecting which of a project's environments to run.

use crate::{errors::EnvironmentFilterError, results::EnvironmentName};
use globset::{Glob, GlobSet, GlobSetBuilder};

/// The environment variable whose comma-separated value is used as the default set of fragments.
pub const TOXENV_ENV: &str = "TOXENV";

/// Selects environments by glob fragment.
///
/// Each fragment `f` matches any environment name matching `*f*`, so `py3` selects `py37` and
/// `py38-django`. Matching is case-sensitive. With no fragments every environment is selected.
#[derive(Clone, Debug)]
pub struct EnvironmentFilter {
    fragments: Vec<String>,
    set: Option<GlobSet>,
}

impl EnvironmentFilter {
    /// A filter that selects every environment.
    pub fn all() -> Self {
        Self {
            fragments: Vec::new(),
            set: None,
        }
    }

    /// Builds a filter from fragments. Empty fragments are ignored.
    pub fn new(
        fragments: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Result<Self, EnvironmentFilterError> {
        let fragments: Vec<String> = fragments
            .into_iter()
            .map(|fragment| fragment.as_ref().trim().to_owned())
            .filter(|fragment| !fragment.is_empty())
            .collect();
        if fragments.is_empty() {
            return Ok(Self::all());
        }

        let mut builder = GlobSetBuilder::new();
        for fragment in &fragments {
            let glob = Glob::new(&format!("*{fragment}*"))
                .map_err(|err| EnvironmentFilterError::new(fragment.clone(), err))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|err| EnvironmentFilterError::new(fragments.join(","), err))?;
        Ok(Self {
            fragments,
            set: Some(set),
        })
    }

    /// Builds a filter from a comma-separated list, as found in `TOXENV`.
    pub fn from_list(list: &str) -> Result<Self, EnvironmentFilterError> {
        Self::new(list.split(','))
    }

    /// Builds a filter from explicit fragments if any were given, otherwise from `toxenv` (the
    /// value of `TOXENV`), otherwise selects everything.
    pub fn from_fragments_or_env(
        fragments: &[String],
        toxenv: Option<&str>,
    ) -> Result<Self, EnvironmentFilterError> {
        if !fragments.is_empty() {
            Self::new(fragments)
        } else if let Some(toxenv) = toxenv {
            Self::from_list(toxenv)
        } else {
            Ok(Self::all())
        }
    }

    /// The fragments this filter was built from.
    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    /// Returns true if `name` is selected.
    pub fn is_match(&self, name: &str) -> bool {
        match &self.set {
            Some(set) => set.is_match(name),
            None => true,
        }
    }

    /// Returns the selected environments, in their original order.
    pub fn filter(&self, environments: Vec<EnvironmentName>) -> Vec<EnvironmentName> {
        environments
            .into_iter()
            .filter(|environment| self.is_match(environment.as_str()))
            .collect()
    }
}

impl Default for EnvironmentFilter {
    fn default() -> Self {
        Self::all()
    }
}

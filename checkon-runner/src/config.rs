// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for checkon.
//!
//! Configuration is layered: the embedded defaults in `default-config.toml` come first, then
//! `checkon.toml` in the current directory (or the file passed in explicitly) is merged over them.

use crate::errors::{ConfigParseError, ConfigParseErrorKind};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::{collections::BTreeSet, num::NonZeroUsize};
use tracing::warn;

/// The placeholder in `tool.install-command` that is replaced with the injected requirement.
pub const REQUIREMENT_PLACEHOLDER: &str = "{requirement}";

/// Overall configuration for checkon.
#[derive(Clone, Debug)]
pub struct CheckonConfig {
    config_file: Option<Utf8PathBuf>,
    inner: CheckonConfigImpl,
}

impl CheckonConfig {
    /// The default location of the config within the current directory.
    pub const CONFIG_PATH: &'static str = "checkon.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// Reads the config, layering `config_file` (or `checkon.toml` under `cwd` if it exists) over
    /// the defaults.
    ///
    /// Relative directories in the config are resolved against `cwd`.
    pub fn from_sources(
        cwd: &Utf8Path,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = cwd.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };
        let loaded = config_file.is_file().then(|| config_file.clone());

        let builder = Self::make_default_config().add_source(source);
        let (mut inner, unknown) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;
        if !unknown.is_empty() {
            warn!(
                "ignoring unknown configuration keys in {config_file}: {}",
                unknown.into_iter().collect::<Vec<_>>().join(", "),
            );
        }
        inner
            .validate()
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;
        inner.resolve_paths(cwd);

        Ok(Self {
            config_file: loaded,
            inner,
        })
    }

    /// Returns the default configuration.
    pub fn default_config() -> Self {
        let builder = Self::make_default_config();
        let (inner, _unknown) = Self::build_and_deserialize_config(&builder)
            .expect("default config is always valid");
        Self {
            config_file: None,
            inner,
        }
    }

    /// The config file that was read on top of the defaults, if one existed.
    pub fn config_file(&self) -> Option<&Utf8Path> {
        self.config_file.as_deref()
    }

    /// The configured cache directory, if any.
    pub fn cache_dir(&self) -> Option<&Utf8Path> {
        self.inner.cache.dir.as_deref()
    }

    /// The version control executable.
    pub fn git_program(&self) -> &str {
        &self.inner.git.program
    }

    /// Settings for the multi-environment test tool.
    pub fn tool(&self) -> &ToolConfig {
        &self.inner.tool
    }

    /// The number of projects to run at once.
    pub fn project_jobs(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.inner.run.project_jobs).unwrap_or(NonZeroUsize::MIN)
    }

    /// The number of environments within one project to run at once.
    pub fn env_jobs(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.inner.run.env_jobs).unwrap_or(NonZeroUsize::MIN)
    }

    /// Whether unhealthy environments are left out of comparisons.
    pub fn exclude_unhealthy(&self) -> bool {
        self.inner.run.exclude_unhealthy
    }

    /// Where to keep per-environment artifacts, if they should be kept.
    pub fn artifacts_dir(&self) -> Option<&Utf8Path> {
        self.inner.run.artifacts_dir.as_deref()
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(CheckonConfigImpl, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: CheckonConfigImpl =
            serde_path_to_error::deserialize(ignored_de).map_err(|error| {
                // The config crate also reports the key. Drop it in favor of the path.
                let path = error.path().clone();
                let error = match error.into_inner() {
                    ConfigError::At { error, .. } => *error,
                    other => other,
                };
                ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                    path, error,
                )))
            })?;

        Ok((config, ignored))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CheckonConfigImpl {
    #[serde(default)]
    cache: CacheConfig,
    git: GitConfig,
    tool: ToolConfig,
    run: RunConfig,
}

impl CheckonConfigImpl {
    fn validate(&self) -> Result<(), ConfigParseErrorKind> {
        if self.tool.command.is_empty() {
            return Err(ConfigParseErrorKind::InvalidValue {
                key: "tool.command",
                reason: "must contain at least the program to run".to_owned(),
            });
        }
        if !self.tool.install_command.contains(REQUIREMENT_PLACEHOLDER) {
            return Err(ConfigParseErrorKind::InvalidValue {
                key: "tool.install-command",
                reason: format!("must contain `{REQUIREMENT_PLACEHOLDER}`"),
            });
        }
        if self.git.program.is_empty() {
            return Err(ConfigParseErrorKind::InvalidValue {
                key: "git.program",
                reason: "must not be empty".to_owned(),
            });
        }
        for (key, value) in [
            ("run.project-jobs", self.run.project_jobs),
            ("run.env-jobs", self.run.env_jobs),
        ] {
            if value == 0 {
                return Err(ConfigParseErrorKind::InvalidValue {
                    key,
                    reason: "must be at least 1".to_owned(),
                });
            }
        }
        Ok(())
    }

    fn resolve_paths(&mut self, cwd: &Utf8Path) {
        for dir in [&mut self.cache.dir, &mut self.run.artifacts_dir]
            .into_iter()
            .flatten()
        {
            if dir.is_relative() {
                *dir = cwd.join(&*dir);
            }
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CacheConfig {
    #[serde(default)]
    dir: Option<Utf8PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct GitConfig {
    program: String,
}

/// Settings for the multi-environment test tool.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ToolConfig {
    /// The tool invocation, as an argument list.
    pub command: Vec<String>,

    /// The command run inside each environment to force-install the injected requirement.
    pub install_command: String,

    /// Options passed to pytest ahead of `--junitxml`.
    #[serde(default)]
    pub pytest_addopts: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RunConfig {
    project_jobs: usize,
    env_jobs: usize,
    exclude_unhealthy: bool,
    #[serde(default)]
    artifacts_dir: Option<Utf8PathBuf>,
}

// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{EnvironmentHealth, EnvironmentName, HealthIssue};
use crate::errors::ParseErrorKind;
use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use std::collections::BTreeMap;

/// The result JSON tox writes with `--result-json`.
///
/// Only the fields checkon reads are modeled. Unknown fields are ignored, and every field the
/// tool may leave out has a default.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct ToxRunMetadata {
    /// The tool version.
    #[serde(default)]
    pub toxversion: Option<String>,
    /// The platform the tool ran on, for example `linux`.
    #[serde(default)]
    pub platform: Option<String>,
    /// The host name.
    #[serde(default)]
    pub host: Option<String>,
    /// The version of this document's format.
    #[serde(default)]
    pub reportversion: Option<String>,
    /// Per-environment records, keyed by environment name.
    #[serde(default)]
    pub testenvs: BTreeMap<String, ToxEnvMetadata>,
}

impl ToxRunMetadata {
    /// Returns the record for `environment`, if the tool wrote one.
    pub fn environment(&self, environment: &EnvironmentName) -> Option<&ToxEnvMetadata> {
        self.testenvs.get(environment.as_str())
    }

    /// Derives health from the setup commands recorded for `environment`.
    pub fn health_of(&self, environment: &EnvironmentName) -> EnvironmentHealth {
        let issues: Vec<_> = self
            .environment(environment)
            .into_iter()
            .flat_map(|env| &env.setup)
            .filter_map(|record| match record.retcode {
                Some(retcode) if retcode != 0 => Some(HealthIssue::SetupCommandFailed {
                    command: record.command.clone(),
                    retcode,
                }),
                _ => None,
            })
            .collect();
        if issues.is_empty() {
            EnvironmentHealth::Healthy
        } else {
            EnvironmentHealth::Unhealthy(issues)
        }
    }
}

/// What the tool recorded for one environment.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct ToxEnvMetadata {
    /// Commands run while creating the environment and installing its dependencies.
    #[serde(default)]
    pub setup: Vec<CommandRecord>,
    /// Commands run as the environment's tests.
    #[serde(default)]
    pub test: Vec<CommandRecord>,
    /// `pip freeze`-style package list, if recorded.
    #[serde(default)]
    pub installed_packages: Vec<String>,
    /// The interpreter the environment used.
    #[serde(default)]
    pub python: Option<PythonInfo>,
}

/// One command the tool ran.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct CommandRecord {
    /// The command and its arguments.
    #[serde(default)]
    pub command: Vec<String>,
    /// The exit code. Older tool versions write this as a string.
    #[serde(default, deserialize_with = "deserialize_retcode")]
    pub retcode: Option<i64>,
    /// Captured output.
    #[serde(default)]
    pub output: String,
}

/// The interpreter an environment ran with.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct PythonInfo {
    /// Full version string.
    #[serde(default)]
    pub version: Option<String>,
    /// Path to the interpreter.
    #[serde(default)]
    pub executable: Option<String>,
    /// Implementation name, for example `CPython`.
    #[serde(default)]
    pub name: Option<String>,
}

fn deserialize_retcode<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Retcode {
        Int(i64),
        Str(String),
    }

    match Option::<Retcode>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Retcode::Int(code)) => Ok(Some(code)),
        Some(Retcode::Str(code)) => code
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("retcode `{code}` is not an integer"))),
    }
}

pub(super) fn parse_metadata(input: &str) -> Result<ToxRunMetadata, ParseErrorKind> {
    let mut deserializer = serde_json::Deserializer::from_str(input);
    serde_path_to_error::deserialize(&mut deserializer).map_err(ParseErrorKind::Json)
}

// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running a checked-out project's environments with one injected requirement.
//!
//! For each checkout the runner performs the tool's one-time setup (only if it has not been done
//! before for this revision), lists the environments, applies the [`EnvironmentFilter`], and
//! then for every selected environment installs the requirement and runs the tests. Failing tests
//! and failed installs are recorded as data. Only a failure to list the environments stops the
//! project.

use crate::{
    cache::Checkout,
    config::ToolConfig,
    env_filter::EnvironmentFilter,
    errors::{DisplayErrorChain, ListEnvironmentsError, ParseError, ProjectRunError},
    helpers::plural,
    requirement::Requirement,
    results::{self, EnvironmentName, EnvironmentRunArtifacts, HealthIssue},
    tool::ToolCommand,
};
use camino::{Utf8Path, Utf8PathBuf};
use futures::prelude::*;
use itertools::Itertools;
use std::{fmt, num::NonZeroUsize};
use tracing::{debug, info, warn};

/// Runs the environments of one checkout.
#[derive(Clone, Debug)]
pub struct EnvironmentRunner {
    tool: ToolConfig,
    filter: EnvironmentFilter,
    env_jobs: NonZeroUsize,
}

impl EnvironmentRunner {
    /// Creates a new runner.
    pub fn new(tool: ToolConfig, filter: EnvironmentFilter, env_jobs: NonZeroUsize) -> Self {
        Self {
            tool,
            filter,
            env_jobs,
        }
    }

    /// The environment filter in use.
    pub fn filter(&self) -> &EnvironmentFilter {
        &self.filter
    }

    /// Runs every selected environment of `checkout` with `requirement` injected, writing
    /// artifacts under `output_root`.
    pub async fn run(
        &self,
        checkout: &Checkout,
        requirement: &Requirement,
        output_root: &Utf8Path,
    ) -> Result<EnvironmentRunSet, ProjectRunError> {
        tokio::fs::create_dir_all(output_root)
            .await
            .map_err(|err| ProjectRunError::OutputRoot {
                path: output_root.to_owned(),
                err,
            })?;

        let tool = ToolCommand::new(&self.tool, checkout.path());
        if checkout.needs_setup() {
            self.setup(checkout, &tool, output_root).await?;
        }

        let listed = list_environments(&tool).await?;
        let listed_count = listed.len();
        let selected = self.filter.filter(listed);
        if selected.len() < listed_count {
            debug!(
                "filter selected {} of {listed_count} {}: {}",
                selected.len(),
                plural::environments_str(listed_count),
                selected.iter().join(", "),
            );
        }
        info!(
            "running {} {} at {} with {requirement}",
            selected.len(),
            plural::environments_str(selected.len()),
            checkout.revision().short(),
        );

        let outcomes: Vec<_> = stream::iter(selected)
            .map(|environment| run_environment(tool, environment, requirement, output_root))
            .buffered(self.env_jobs.get())
            .collect()
            .await;

        let (environment_runs, omitted): (Vec<_>, Vec<_>) =
            outcomes.into_iter().partition_result();
        for omitted in &omitted {
            warn!(
                "environment {} produced no usable artifacts: {}",
                omitted.environment, omitted.reason
            );
        }

        Ok(EnvironmentRunSet {
            environment_runs,
            omitted,
        })
    }

    async fn setup(
        &self,
        checkout: &Checkout,
        tool: &ToolCommand<'_>,
        output_root: &Utf8Path,
    ) -> Result<(), ProjectRunError> {
        let invocation = tool.setup(&output_root.join("tox_setup.json"));
        info!("setting up environments at {}", checkout.revision().short());
        match invocation.output().await {
            Ok(output) => {
                if !output.success {
                    warn!(
                        "`{}` failed with {}; continuing",
                        invocation.command_line(),
                        crate::helpers::DisplayExitCode(output.exit_code),
                    );
                }
                checkout.mark_setup_complete(output.exit_code)?;
            }
            Err(err) => {
                // Leave the marker unwritten so the next acquisition tries again.
                warn!(
                    "failed to run `{}`: {}",
                    invocation.command_line(),
                    DisplayErrorChain::new(&err)
                );
            }
        }
        Ok(())
    }
}

async fn list_environments(
    tool: &ToolCommand<'_>,
) -> Result<Vec<EnvironmentName>, ListEnvironmentsError> {
    let invocation = tool.list();
    let output = invocation
        .output()
        .await
        .map_err(|err| ListEnvironmentsError::Spawn {
            command: invocation.command_line(),
            err,
        })?;
    if !output.success {
        return Err(ListEnvironmentsError::Failed {
            command: invocation.command_line(),
            exit_code: output.exit_code,
            stderr: output.stderr,
        });
    }
    parse_environment_list(&output.stdout).map_err(|err| ListEnvironmentsError::InvalidName {
        command: invocation.command_line(),
        err,
    })
}

fn parse_environment_list(
    stdout: &str,
) -> Result<Vec<EnvironmentName>, crate::errors::InvalidEnvironmentName> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .unique()
        .map(EnvironmentName::new)
        .collect()
}

async fn run_environment(
    tool: ToolCommand<'_>,
    environment: EnvironmentName,
    requirement: &Requirement,
    output_root: &Utf8Path,
) -> Result<EnvironmentRunArtifacts, OmittedEnvironment> {
    let report = results::report_path(output_root, &environment);
    let metadata = results::metadata_path(output_root, &environment);
    if let Err(err) = tokio::fs::create_dir_all(output_root.join(environment.as_str())).await {
        return Err(OmittedEnvironment::new(
            environment,
            OmitReason::SpawnFailed {
                message: format!("failed to create output directory: {err}"),
            },
        ));
    }

    let install = tool.install(&environment, requirement);
    let install_issue = match install.output().await {
        Ok(output) if output.success => None,
        Ok(output) => Some(HealthIssue::InstallFailed {
            exit_code: output.exit_code,
        }),
        Err(err) => Some(HealthIssue::InstallNotStarted {
            message: err.to_string(),
        }),
    };
    if let Some(issue) = &install_issue {
        warn!("[{environment}] {issue}; running tests anyway");
    }

    let test = tool.test(&environment, &report, &metadata);
    match test.output().await {
        Ok(output) => {
            // A nonzero exit here usually means tests failed, which is what the report is for.
            debug!(
                "[{environment}] `{}` exited with {}",
                test.command_line(),
                crate::helpers::DisplayExitCode(output.exit_code),
            );
        }
        Err(err) => {
            return Err(OmittedEnvironment::new(
                environment,
                OmitReason::SpawnFailed {
                    message: DisplayErrorChain::new(&err).to_string(),
                },
            ));
        }
    }

    let missing: Vec<_> = [&report, &metadata]
        .into_iter()
        .filter(|path| !path.is_file())
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(OmittedEnvironment::new(
            environment,
            OmitReason::ArtifactsMissing { missing },
        ));
    }

    let artifacts = results::parse(&report, &metadata)
        .map_err(|err| OmittedEnvironment::new(environment.clone(), OmitReason::Parse(err)))?;
    Ok(match install_issue {
        Some(issue) => artifacts.with_health_issue(issue),
        None => artifacts,
    })
}

/// The outcome of one [`EnvironmentRunner::run`].
#[derive(Debug)]
pub struct EnvironmentRunSet {
    /// Environments that produced usable artifacts, in the order they were listed.
    pub environment_runs: Vec<EnvironmentRunArtifacts>,
    /// Environments that were selected but produced nothing usable.
    pub omitted: Vec<OmittedEnvironment>,
}

/// An environment that was selected but produced no usable artifacts.
#[derive(Debug)]
pub struct OmittedEnvironment {
    /// The environment name.
    pub environment: EnvironmentName,
    /// What went wrong.
    pub reason: OmitReason,
}

impl OmittedEnvironment {
    fn new(environment: EnvironmentName, reason: OmitReason) -> Self {
        Self {
            environment,
            reason,
        }
    }
}

/// Why an environment produced no usable artifacts.
#[derive(Debug)]
pub enum OmitReason {
    /// The test command could not be started.
    SpawnFailed {
        /// The error message.
        message: String,
    },

    /// The test command ran but did not write one or both artifacts.
    ArtifactsMissing {
        /// The artifacts that were not written.
        missing: Vec<Utf8PathBuf>,
    },

    /// The artifacts were written but could not be parsed.
    Parse(ParseError),
}

impl fmt::Display for OmitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpawnFailed { message } => write!(f, "test run could not be started: {message}"),
            Self::ArtifactsMissing { missing } => {
                write!(f, "test run did not write {}", missing.iter().join(", "))
            }
            Self::Parse(err) => write!(f, "{}", DisplayErrorChain::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn environment_list_is_trimmed_and_deduplicated() {
        let names = parse_environment_list("py37\n  py38 \n\npy37\nlint\n").unwrap();
        assert_eq!(
            names.iter().map(EnvironmentName::as_str).collect::<Vec<_>>(),
            ["py37", "py38", "lint"]
        );
    }

    #[test]
    fn environment_list_rejects_paths() {
        parse_environment_list("py37\n../escape\n").expect_err("path separator");
    }

    #[test]
    fn omit_reasons_display() {
        let reason = OmitReason::ArtifactsMissing {
            missing: vec![Utf8PathBuf::from("out/py38/test_py38.xml")],
        };
        assert_eq!(
            reason.to_string(),
            "test run did not write out/py38/test_py38.xml"
        );
        let reason = OmitReason::SpawnFailed {
            message: "No such file or directory".to_owned(),
        };
        assert_eq!(
            reason.to_string(),
            "test run could not be started: No such file or directory"
        );
    }
}

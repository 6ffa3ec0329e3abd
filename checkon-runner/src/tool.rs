// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command lines for the external multi-environment test tool.
//!
//! checkon relies on four things from the tool: one-time environment setup, listing environment
//! names, running an arbitrary command inside one environment, and running one environment's
//! tests with pytest's JUnit output redirected to a fixed path.

use crate::{
    config::{REQUIREMENT_PLACEHOLDER, ToolConfig},
    requirement::Requirement,
    results::EnvironmentName,
};
use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;
use std::{io, process::Stdio};
use tokio::process::Command;
use tracing::debug;

const PYTEST_ADDOPTS_ENV: &str = "PYTEST_ADDOPTS";
const TOX_TESTENV_PASSENV_ENV: &str = "TOX_TESTENV_PASSENV";

/// Builds tool invocations for one checkout.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ToolCommand<'a> {
    config: &'a ToolConfig,
    checkout: &'a Utf8Path,
}

impl<'a> ToolCommand<'a> {
    pub(crate) fn new(config: &'a ToolConfig, checkout: &'a Utf8Path) -> Self {
        Self { config, checkout }
    }

    /// Creates every environment without running tests.
    pub(crate) fn setup(&self, result_json: &Utf8Path) -> ToolInvocation {
        self.invocation([
            "--notest",
            "-c",
            self.checkout.as_str(),
            "--result-json",
            result_json.as_str(),
        ])
    }

    /// Lists environment names, one per line.
    pub(crate) fn list(&self) -> ToolInvocation {
        self.invocation(["-l"])
    }

    /// Force-installs `requirement` inside `environment`.
    pub(crate) fn install(
        &self,
        environment: &EnvironmentName,
        requirement: &Requirement,
    ) -> ToolInvocation {
        let quoted = requirement
            .install_args()
            .into_iter()
            .map(shell_words::quote)
            .join(" ");
        let install_command = self
            .config
            .install_command
            .replace(REQUIREMENT_PLACEHOLDER, &quoted);
        self.invocation([
            "-e",
            environment.as_str(),
            "--run-command",
            install_command.as_str(),
        ])
    }

    /// Runs the tests of `environment`, writing the JUnit report to `report` and the tool's
    /// result JSON to `result_json`.
    pub(crate) fn test(
        &self,
        environment: &EnvironmentName,
        report: &Utf8Path,
        result_json: &Utf8Path,
    ) -> ToolInvocation {
        let mut invocation = self.invocation([
            "--result-json",
            result_json.as_str(),
            "-e",
            environment.as_str(),
        ]);
        invocation.envs = test_env(
            &self.config.pytest_addopts,
            report,
            std::env::var(PYTEST_ADDOPTS_ENV).ok().as_deref(),
            std::env::var(TOX_TESTENV_PASSENV_ENV).ok().as_deref(),
        );
        invocation
    }

    fn invocation<'s>(&self, args: impl IntoIterator<Item = &'s str>) -> ToolInvocation
    where
        'a: 's,
    {
        let argv = self
            .config
            .command
            .iter()
            .map(String::as_str)
            .chain(args)
            .map(str::to_owned)
            .collect();
        ToolInvocation {
            argv,
            cwd: self.checkout.to_owned(),
            envs: Vec::new(),
        }
    }
}

/// The environment variables set for a test run.
///
/// pytest reads extra options from `PYTEST_ADDOPTS`, and tox only passes it through to the
/// environment if it is named in `TOX_TESTENV_PASSENV`. Inherited values are kept.
fn test_env(
    pytest_addopts: &str,
    report: &Utf8Path,
    inherited_addopts: Option<&str>,
    inherited_passenv: Option<&str>,
) -> Vec<(String, String)> {
    let junitxml = format!("--junitxml={}", shell_words::quote(report.as_str()));
    let addopts = [pytest_addopts, junitxml.as_str(), inherited_addopts.unwrap_or_default()]
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .join(" ");
    let passenv = match inherited_passenv.map(str::trim) {
        Some(inherited) if !inherited.is_empty() => format!("{inherited} {PYTEST_ADDOPTS_ENV}"),
        _ => PYTEST_ADDOPTS_ENV.to_owned(),
    };
    vec![
        (PYTEST_ADDOPTS_ENV.to_owned(), addopts),
        (TOX_TESTENV_PASSENV_ENV.to_owned(), passenv),
    ]
}

/// A fully specified tool command, ready to run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ToolInvocation {
    argv: Vec<String>,
    cwd: Utf8PathBuf,
    envs: Vec<(String, String)>,
}

impl ToolInvocation {
    /// The command line, shell-quoted, for logs and error messages.
    pub(crate) fn command_line(&self) -> String {
        shell_words::join(&self.argv)
    }

    /// Runs the command to completion, capturing its output.
    ///
    /// The child is killed if the returned future is dropped.
    pub(crate) async fn output(&self) -> io::Result<ToolOutput> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty tool command"))?;
        debug!("running `{}` in {}", self.command_line(), self.cwd);

        let output = Command::new(program)
            .args(args)
            .current_dir(&self.cwd)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let output = ToolOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        for line in output.stdout.lines().chain(output.stderr.lines()) {
            debug!(target: "checkon_runner::tool::output", "{line}");
        }
        Ok(output)
    }
}

/// What a finished tool command produced.
#[derive(Clone, Debug)]
pub(crate) struct ToolOutput {
    pub(crate) success: bool,
    pub(crate) exit_code: Option<i32>,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The normalized result model, and parsing of the artifacts one environment run leaves behind.
//!
//! Every environment run writes two files into its own directory under the run's output root:
//!
//! * `{output_root}/{env}/test_{env}.xml`: the JUnit report written by pytest.
//! * `{output_root}/{env}/tox_{env}.json`: the result JSON written by tox.
//!
//! The directory name is the environment name, and it is the join key between the two files.

mod junit;
mod tox_json;

pub use tox_json::{CommandRecord, PythonInfo, ToxEnvMetadata, ToxRunMetadata};

use crate::{
    errors::{InvalidEnvironmentName, ParseError, ParseErrorKind},
    requirement::Requirement,
};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::{borrow::Borrow, fmt, time::Duration};

/// The name of one environment in a project's test matrix, for example `py38`.
///
/// Environment names are used as directory names, so path separators and `.`/`..` are rejected.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentName(String);

impl EnvironmentName {
    /// Creates a new environment name, validating it.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidEnvironmentName> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("name is empty")
        } else if name == "." || name == ".." {
            Some("name is a relative path component")
        } else if name.contains(['/', '\\']) {
            Some("name contains a path separator")
        } else if name.chars().any(char::is_control) {
            Some("name contains a control character")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(InvalidEnvironmentName::new(name, reason)),
            None => Ok(Self(name)),
        }
    }

    /// Returns the name as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvironmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EnvironmentName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for EnvironmentName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Whether a non-success block was recorded as an assertion failure or as an error.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// A `<failure>` element.
    Failure,
    /// An `<error>` element.
    Error,
}

/// A recorded failure of one test case.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    /// Whether this was a failure or an error.
    pub kind: FailureKind,
    /// The `message` attribute, or the empty string if none was present.
    pub message: String,
    /// The element text, split into lines.
    pub detail_lines: Vec<String>,
}

/// What makes two test results "the same test" for comparison purposes.
///
/// Duration, timestamps and failure message text are deliberately not part of the identity.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TestCaseIdentity {
    /// The test name.
    pub name: String,
    /// The class name, for pytest the dotted module path.
    pub classname: Option<String>,
    /// The file the test is defined in.
    pub file: Option<String>,
    /// The line the test is defined on.
    pub line: Option<u32>,
}

impl fmt::Display for TestCaseIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.classname {
            Some(classname) => write!(f, "{classname}::{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// The outcome of one test case in one suite.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestCaseResult {
    /// The test name.
    pub name: String,
    /// The class name.
    pub classname: Option<String>,
    /// The source file.
    pub file: Option<String>,
    /// The source line.
    pub line: Option<u32>,
    /// How long the test took, if recorded.
    pub duration: Option<Duration>,
    /// True if the test case was marked as skipped.
    pub skipped: bool,
    /// The failure, if the test case did not pass.
    pub failure: Option<Failure>,
}

impl TestCaseResult {
    /// Returns the identity of this test case.
    pub fn identity(&self) -> TestCaseIdentity {
        TestCaseIdentity {
            name: self.name.clone(),
            classname: self.classname.clone(),
            file: self.file.clone(),
            line: self.line,
        }
    }

    /// Returns true if this test case failed or errored.
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

/// Summary counts as declared by a suite.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SuiteCounts {
    /// The number of test cases that errored.
    pub errors: usize,
    /// The number of test cases that failed.
    pub failures: usize,
    /// The number of test cases that were skipped.
    pub skipped: usize,
    /// The total number of test cases.
    pub total: usize,
}

/// One parsed test suite, which is one environment run's worth of test cases.
#[derive(Clone, Debug, PartialEq)]
pub struct TestSuiteResult {
    /// The environment this suite came from.
    pub environment: EnvironmentName,
    /// The suite's `name` attribute, or the empty string.
    pub name: String,
    /// The counts the report declared.
    pub counts: SuiteCounts,
    /// The suite duration, if recorded.
    pub duration: Option<Duration>,
    /// The suite start time, if recorded.
    pub timestamp: Option<DateTime<FixedOffset>>,
    /// The host the suite ran on, if recorded.
    pub host: Option<String>,
    /// Test cases in document order.
    pub test_cases: Vec<TestCaseResult>,
}

impl TestSuiteResult {
    /// Recomputes the summary counts from the test cases themselves.
    pub fn derived_counts(&self) -> SuiteCounts {
        let mut counts = SuiteCounts {
            total: self.test_cases.len(),
            ..SuiteCounts::default()
        };
        for case in &self.test_cases {
            match case.failure.as_ref().map(|failure| failure.kind) {
                Some(FailureKind::Failure) => counts.failures += 1,
                Some(FailureKind::Error) => counts.errors += 1,
                None if case.skipped => counts.skipped += 1,
                None => {}
            }
        }
        counts
    }

    /// Returns the test cases that failed or errored.
    pub fn failed_cases(&self) -> impl Iterator<Item = &TestCaseResult> + '_ {
        self.test_cases.iter().filter(|case| case.is_failure())
    }
}

/// A reason an environment was considered unhealthy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HealthIssue {
    /// The tool recorded a setup command that exited with a nonzero code.
    SetupCommandFailed {
        /// The command as recorded.
        command: Vec<String>,
        /// Its exit code.
        retcode: i64,
    },

    /// Installing the injected requirement exited unsuccessfully.
    InstallFailed {
        /// The exit code, or `None` if the process was terminated by a signal.
        exit_code: Option<i32>,
    },

    /// Installing the injected requirement could not be started.
    InstallNotStarted {
        /// The error message.
        message: String,
    },
}

impl fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetupCommandFailed { command, retcode } => write!(
                f,
                "setup command `{}` exited with code {retcode}",
                shell_words::join(command)
            ),
            Self::InstallFailed {
                exit_code: Some(code),
            } => write!(f, "requirement installation exited with code {code}"),
            Self::InstallFailed { exit_code: None } => {
                f.write_str("requirement installation was terminated by a signal")
            }
            Self::InstallNotStarted { message } => {
                write!(f, "requirement installation could not be started: {message}")
            }
        }
    }
}

/// Whether the environment's setup and dependency installation went cleanly.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum EnvironmentHealth {
    /// Nothing went wrong before the tests ran.
    #[default]
    Healthy,

    /// Something went wrong before the tests ran. The tests ran anyway, so their failures may not
    /// say anything about the injected requirement.
    Unhealthy(Vec<HealthIssue>),
}

impl EnvironmentHealth {
    /// Returns true if the environment is healthy.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Returns the issues recorded, if any.
    pub fn issues(&self) -> &[HealthIssue] {
        match self {
            Self::Healthy => &[],
            Self::Unhealthy(issues) => issues,
        }
    }

    fn with_issue(self, issue: HealthIssue) -> Self {
        match self {
            Self::Healthy => Self::Unhealthy(vec![issue]),
            Self::Unhealthy(mut issues) => {
                issues.push(issue);
                Self::Unhealthy(issues)
            }
        }
    }
}

/// Everything one environment run produced, joined on the environment name.
#[derive(Clone, Debug, PartialEq)]
pub struct EnvironmentRunArtifacts {
    /// The environment name.
    pub environment: EnvironmentName,
    /// The parsed test suite.
    pub suite: TestSuiteResult,
    /// The tool's own record of the run.
    pub runner_metadata: ToxRunMetadata,
    /// Whether setup went cleanly.
    pub health: EnvironmentHealth,
}

impl EnvironmentRunArtifacts {
    /// Returns these artifacts with an additional health issue recorded.
    pub fn with_health_issue(self, issue: HealthIssue) -> Self {
        Self {
            health: self.health.with_issue(issue),
            ..self
        }
    }
}

/// The outcome of running one project with one injected requirement.
#[derive(Debug)]
pub struct ProjectRunResult {
    /// The repository URL.
    pub project_url: String,
    /// The revision that was run.
    pub revision: crate::cache::Revision,
    /// The requirement that was injected.
    pub requirement: Requirement,
    /// One entry per environment that produced usable artifacts, in run order.
    pub environment_runs: Vec<EnvironmentRunArtifacts>,
    /// Environments that were selected but produced no usable artifacts.
    pub omitted: Vec<crate::env_runner::OmittedEnvironment>,
}

/// The path of the JUnit report for `environment` under `output_root`.
pub fn report_path(output_root: &Utf8Path, environment: &EnvironmentName) -> Utf8PathBuf {
    output_root
        .join(environment.as_str())
        .join(format!("test_{environment}.xml"))
}

/// The path of the tool result JSON for `environment` under `output_root`.
pub fn metadata_path(output_root: &Utf8Path, environment: &EnvironmentName) -> Utf8PathBuf {
    output_root
        .join(environment.as_str())
        .join(format!("tox_{environment}.json"))
}

/// Parses one environment's JUnit report and tool result JSON into [`EnvironmentRunArtifacts`].
///
/// The environment name is taken from the directory both files live in. Health is derived from
/// the setup commands recorded in the result JSON.
pub fn parse(
    test_report_path: &Utf8Path,
    run_metadata_path: &Utf8Path,
) -> Result<EnvironmentRunArtifacts, ParseError> {
    let environment = environment_from_dir(test_report_path)?;
    let metadata_environment = environment_from_dir(run_metadata_path)?;
    if environment != metadata_environment {
        return Err(ParseError::new(
            run_metadata_path,
            ParseErrorKind::MismatchedEnvironment {
                report: environment,
                metadata: metadata_environment,
            },
        ));
    }

    let report = read(test_report_path)?;
    let suite = junit::parse_suite(&report, environment.clone())
        .map_err(|kind| ParseError::new(test_report_path, kind))?;

    let metadata = read(run_metadata_path)?;
    let runner_metadata = tox_json::parse_metadata(&metadata)
        .map_err(|kind| ParseError::new(run_metadata_path, kind))?;

    let health = runner_metadata.health_of(&environment);

    Ok(EnvironmentRunArtifacts {
        environment,
        suite,
        runner_metadata,
        health,
    })
}

/// Parses the artifacts for one environment under `output_root`, using the fixed file layout.
pub fn parse_environment(
    output_root: &Utf8Path,
    environment: &EnvironmentName,
) -> Result<EnvironmentRunArtifacts, ParseError> {
    parse(
        &report_path(output_root, environment),
        &metadata_path(output_root, environment),
    )
}

/// Parses every environment directory under `output_root`, in name order.
///
/// Entries that are not directories are ignored. A directory that fails to parse is reported in
/// place and does not stop the others from being parsed.
pub fn parse_output_root(
    output_root: &Utf8Path,
) -> Result<Vec<Result<EnvironmentRunArtifacts, ParseError>>, ParseError> {
    let read_dir = output_root
        .read_dir_utf8()
        .map_err(|err| ParseError::new(output_root, ParseErrorKind::Read(err)))?;
    let mut entries = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|err| ParseError::new(output_root, ParseErrorKind::Read(err)))?;
        let is_dir = entry
            .file_type()
            .map_err(|err| ParseError::new(entry.path(), ParseErrorKind::Read(err)))?
            .is_dir();
        if is_dir {
            entries.push(entry.path().to_owned());
        }
    }
    entries.sort_unstable();

    Ok(entries
        .iter()
        .map(|dir| {
            let dir_name = dir.file_name().unwrap_or_default();
            let environment = EnvironmentName::new(dir_name).map_err(|err| {
                ParseError::new(dir.as_path(), ParseErrorKind::InvalidEnvironment(err))
            })?;
            parse_environment(output_root, &environment)
        })
        .collect())
}

fn environment_from_dir(path: &Utf8Path) -> Result<EnvironmentName, ParseError> {
    let dir_name = path
        .parent()
        .and_then(|parent| parent.file_name())
        .ok_or_else(|| ParseError::new(path, ParseErrorKind::NoEnvironmentDir))?;
    EnvironmentName::new(dir_name)
        .map_err(|err| ParseError::new(path, ParseErrorKind::InvalidEnvironment(err)))
}

fn read(path: &Utf8Path) -> Result<String, ParseError> {
    std::fs::read_to_string(path).map_err(|err| ParseError::new(path, ParseErrorKind::Read(err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    const REPORT: &str = indoc! {r#"
        <?xml version="1.0" encoding="utf-8"?>
        <testsuites>
          <testsuite name="pytest" errors="0" failures="1" skipped="0" tests="2" time="0.5"
                     timestamp="2019-10-20T01:02:03.456789" hostname="builder">
            <testcase classname="tests.test_mod" file="tests/test_mod.py" line="3" name="test_ok" time="0.1"/>
            <testcase classname="tests.test_mod" file="tests/test_mod.py" line="7" name="test_foo" time="0.2">
              <failure message="assert 1 == 2">def test_foo():
        &gt;       assert 1 == 2
        E       assert 1 == 2</failure>
            </testcase>
          </testsuite>
        </testsuites>
    "#};

    const METADATA: &str = indoc! {r#"
        {
          "toxversion": "3.14.0",
          "platform": "linux",
          "reportversion": "1",
          "host": "builder",
          "testenvs": {
            "py38": {
              "setup": [
                {"command": ["python", "-m", "pip", "install", "pytest"], "retcode": "0", "output": ""}
              ],
              "test": [
                {"command": ["pytest"], "retcode": 1, "output": "1 failed"}
              ],
              "python": {"version": "3.8.0", "executable": "/usr/bin/python3.8"}
            }
          }
        }
    "#};

    fn write_environment(root: &Utf8Path, env: &str, report: &str, metadata: &str) {
        let environment = EnvironmentName::new(env).unwrap();
        std::fs::create_dir_all(root.join(env)).unwrap();
        std::fs::write(report_path(root, &environment), report).unwrap();
        std::fs::write(metadata_path(root, &environment), metadata).unwrap();
    }

    #[test]
    fn parse_joins_on_directory_name() {
        let dir = Utf8TempDir::new().unwrap();
        write_environment(dir.path(), "py38", REPORT, METADATA);

        let environment = EnvironmentName::new("py38").unwrap();
        let artifacts = parse_environment(dir.path(), &environment).expect("artifacts parse");

        assert_eq!(artifacts.environment, environment);
        assert_eq!(artifacts.suite.environment, environment);
        assert_eq!(artifacts.suite.test_cases.len(), 2);
        assert_eq!(artifacts.health, EnvironmentHealth::Healthy);
        assert_eq!(
            artifacts.runner_metadata.toxversion.as_deref(),
            Some("3.14.0")
        );

        let failed: Vec<_> = artifacts
            .suite
            .failed_cases()
            .map(|case| case.name.as_str())
            .collect();
        assert_eq!(failed, ["test_foo"]);
        let failure = artifacts.suite.test_cases[1].failure.as_ref().unwrap();
        assert_eq!(failure.message, "assert 1 == 2");
        assert_eq!(
            failure.detail_lines,
            [
                "def test_foo():",
                ">       assert 1 == 2",
                "E       assert 1 == 2"
            ]
        );
    }

    #[test]
    fn parse_marks_failed_setup_unhealthy() {
        let dir = Utf8TempDir::new().unwrap();
        let metadata = METADATA.replace(r#""retcode": "0""#, r#""retcode": "2""#);
        write_environment(dir.path(), "py38", REPORT, &metadata);

        let environment = EnvironmentName::new("py38").unwrap();
        let artifacts = parse_environment(dir.path(), &environment).expect("artifacts parse");
        assert_eq!(
            artifacts.health,
            EnvironmentHealth::Unhealthy(vec![HealthIssue::SetupCommandFailed {
                command: vec![
                    "python".to_owned(),
                    "-m".to_owned(),
                    "pip".to_owned(),
                    "install".to_owned(),
                    "pytest".to_owned()
                ],
                retcode: 2,
            }])
        );
    }

    #[test]
    fn parse_rejects_mismatched_directories() {
        let dir = Utf8TempDir::new().unwrap();
        write_environment(dir.path(), "py37", REPORT, METADATA);
        write_environment(dir.path(), "py38", REPORT, METADATA);

        let py37 = EnvironmentName::new("py37").unwrap();
        let py38 = EnvironmentName::new("py38").unwrap();
        let err = parse(
            &report_path(dir.path(), &py37),
            &metadata_path(dir.path(), &py38),
        )
        .expect_err("directories differ");
        assert!(
            matches!(err.kind(), ParseErrorKind::MismatchedEnvironment { .. }),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn parse_output_root_reports_each_environment() {
        let dir = Utf8TempDir::new().unwrap();
        write_environment(dir.path(), "py38", REPORT, METADATA);
        write_environment(dir.path(), "py37", "<testsuites>", METADATA);
        std::fs::write(dir.path().join("tox_setup.json"), "{}").unwrap();

        let results = parse_output_root(dir.path()).expect("output root is readable");
        assert_eq!(results.len(), 2);
        let err = results[0].as_ref().expect_err("py37 report is truncated");
        assert_eq!(
            err.path(),
            report_path(dir.path(), &EnvironmentName::new("py37").unwrap()).as_path()
        );
        assert_eq!(
            results[1].as_ref().expect("py38 parses").environment.as_str(),
            "py38"
        );
    }

    #[cfg(unix)]
    #[test]
    fn parse_output_root_isolates_invalid_directory_names() {
        let dir = Utf8TempDir::new().unwrap();
        write_environment(dir.path(), "py38", REPORT, METADATA);
        let bad = dir.path().join("bad\u{1}env");
        std::fs::create_dir(&bad).unwrap();

        let results = parse_output_root(dir.path()).expect("output root is readable");
        assert_eq!(results.len(), 2);
        let err = results[0].as_ref().expect_err("name has a control character");
        assert_eq!(err.path(), bad.as_path());
        assert!(
            matches!(err.kind(), ParseErrorKind::InvalidEnvironment(_)),
            "unexpected error: {err:?}"
        );
        assert_eq!(
            results[1].as_ref().expect("py38 parses").environment.as_str(),
            "py38"
        );
    }

    #[test]
    fn parse_reports_missing_file() {
        let dir = Utf8TempDir::new().unwrap();
        let environment = EnvironmentName::new("py38").unwrap();
        let err = parse_environment(dir.path(), &environment).expect_err("nothing was written");
        assert!(matches!(err.kind(), ParseErrorKind::Read(_)));
    }

    #[test_case("py38", true ; "plain")]
    #[test_case("py38-django{22}", true ; "factor braces")]
    #[test_case("", false ; "empty")]
    #[test_case("..", false ; "parent dir")]
    #[test_case("a/b", false ; "separator")]
    #[test_case("a\\b", false ; "backslash")]
    fn environment_name_validation(name: &str, valid: bool) {
        assert_eq!(EnvironmentName::new(name).is_ok(), valid);
    }

    #[test]
    fn derived_counts_tally_outcomes() {
        let case = |name: &str, skipped: bool, kind: Option<FailureKind>| TestCaseResult {
            name: name.to_owned(),
            classname: None,
            file: None,
            line: None,
            duration: None,
            skipped,
            failure: kind.map(|kind| Failure {
                kind,
                message: String::new(),
                detail_lines: vec![],
            }),
        };
        let suite = TestSuiteResult {
            environment: EnvironmentName::new("py38").unwrap(),
            name: String::new(),
            counts: SuiteCounts::default(),
            duration: None,
            timestamp: None,
            host: None,
            test_cases: vec![
                case("a", false, None),
                case("b", true, None),
                case("c", false, Some(FailureKind::Failure)),
                case("d", false, Some(FailureKind::Error)),
                case("e", false, Some(FailureKind::Failure)),
            ],
        };
        assert_eq!(
            suite.derived_counts(),
            SuiteCounts {
                errors: 1,
                failures: 2,
                skipped: 1,
                total: 5,
            }
        );
    }
}

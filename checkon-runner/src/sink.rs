// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Flattening run results into relational records, and writing them out.
//!
//! A [`ProjectRunResult`] is a tree: project run, environment runs, suites, test cases and
//! failures. [`RecordFlattener`] turns it into a flat list of [`ResultRecord`]s where each child
//! refers to its parent by id, ready to be loaded into a relational store. Ids are unique across
//! everything a single flattener produces.

use crate::{
    errors::RecordSinkError,
    results::{EnvironmentRunArtifacts, FailureKind, ProjectRunResult, TestCaseIdentity},
};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use std::{
    collections::HashMap,
    fs::File,
    io::{BufWriter, Write},
};

/// One row, tagged with the table it belongs to.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum ResultRecord {
    /// One project run with one injected requirement.
    ProjectRun(ProjectRunRecord),
    /// One environment within a project run.
    EnvironmentRun(EnvironmentRunRecord),
    /// The test suite of one environment run.
    SuiteRun(SuiteRunRecord),
    /// A distinct test, deduplicated within an environment run.
    TestCase(TestCaseRecord),
    /// One execution of a test case within a suite.
    TestCaseRun(TestCaseRunRecord),
    /// The failure of one test case run.
    TestFailure(TestFailureRecord),
}

impl ResultRecord {
    /// The table this record belongs to.
    pub fn table_name(&self) -> &'static str {
        match self {
            Self::ProjectRun(_) => "project_run",
            Self::EnvironmentRun(_) => "environment_run",
            Self::SuiteRun(_) => "suite_run",
            Self::TestCase(_) => "test_case",
            Self::TestCaseRun(_) => "test_case_run",
            Self::TestFailure(_) => "test_failure",
        }
    }

    /// The record's own id.
    pub fn id(&self) -> u64 {
        match self {
            Self::ProjectRun(record) => record.id,
            Self::EnvironmentRun(record) => record.id,
            Self::SuiteRun(record) => record.id,
            Self::TestCase(record) => record.id,
            Self::TestCaseRun(record) => record.id,
            Self::TestFailure(record) => record.id,
        }
    }
}

#[expect(missing_docs)]
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ProjectRunRecord {
    pub id: u64,
    pub project_url: String,
    pub revision: String,
    pub requirement: String,
}

#[expect(missing_docs)]
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct EnvironmentRunRecord {
    pub id: u64,
    pub project_run_id: u64,
    pub environment: String,
    pub healthy: bool,
    pub health_issues: Vec<String>,
    pub tool_version: Option<String>,
    pub platform: Option<String>,
    pub python_version: Option<String>,
    pub installed_packages: Vec<String>,
}

#[expect(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SuiteRunRecord {
    pub id: u64,
    pub environment_run_id: u64,
    pub name: String,
    /// RFC 3339.
    pub start_time: Option<String>,
    pub duration_secs: Option<f64>,
    pub host: Option<String>,
    pub errors: usize,
    pub failures: usize,
    pub skipped: usize,
    pub total: usize,
}

#[expect(missing_docs)]
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TestCaseRecord {
    pub id: u64,
    pub environment_run_id: u64,
    pub name: String,
    pub classname: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

#[expect(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TestCaseRunRecord {
    pub id: u64,
    pub suite_run_id: u64,
    pub test_case_id: u64,
    pub duration_secs: Option<f64>,
    pub outcome: TestOutcome,
}

#[expect(missing_docs)]
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TestFailureRecord {
    pub id: u64,
    pub test_case_run_id: u64,
    pub kind: FailureKind,
    pub message: String,
    pub text: String,
}

/// How one test case run ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestOutcome {
    /// The test passed.
    Passed,
    /// The test was skipped.
    Skipped,
    /// The test recorded a `<failure>`.
    Failed,
    /// The test recorded an `<error>`.
    Error,
}

/// Turns run results into records, allocating ids as it goes.
#[derive(Debug)]
pub struct RecordFlattener {
    next_id: u64,
}

impl RecordFlattener {
    /// Creates a new flattener. The first id handed out is 1.
    pub fn new() -> Self {
        Self { next_id: 1 }
    }

    /// Flattens one project run, parents before children.
    pub fn flatten(&mut self, run: &ProjectRunResult) -> Vec<ResultRecord> {
        let project_run_id = self.allocate();
        let mut records = vec![ResultRecord::ProjectRun(ProjectRunRecord {
            id: project_run_id,
            project_url: run.project_url.clone(),
            revision: run.revision.to_string(),
            requirement: run.requirement.install_arg().to_owned(),
        })];
        for env_run in &run.environment_runs {
            self.flatten_environment(project_run_id, env_run, &mut records);
        }
        records
    }

    fn flatten_environment(
        &mut self,
        project_run_id: u64,
        env_run: &EnvironmentRunArtifacts,
        records: &mut Vec<ResultRecord>,
    ) {
        let environment_run_id = self.allocate();
        let tool_env = env_run.runner_metadata.environment(&env_run.environment);
        records.push(ResultRecord::EnvironmentRun(EnvironmentRunRecord {
            id: environment_run_id,
            project_run_id,
            environment: env_run.environment.to_string(),
            healthy: env_run.health.is_healthy(),
            health_issues: env_run
                .health
                .issues()
                .iter()
                .map(ToString::to_string)
                .collect(),
            tool_version: env_run.runner_metadata.toxversion.clone(),
            platform: env_run.runner_metadata.platform.clone(),
            python_version: tool_env
                .and_then(|env| env.python.as_ref())
                .and_then(|python| python.version.clone()),
            installed_packages: tool_env
                .map(|env| env.installed_packages.clone())
                .unwrap_or_default(),
        }));

        let suite = &env_run.suite;
        let suite_run_id = self.allocate();
        records.push(ResultRecord::SuiteRun(SuiteRunRecord {
            id: suite_run_id,
            environment_run_id,
            name: suite.name.clone(),
            start_time: suite.timestamp.map(|timestamp| timestamp.to_rfc3339()),
            duration_secs: suite.duration.map(|duration| duration.as_secs_f64()),
            host: suite.host.clone(),
            errors: suite.counts.errors,
            failures: suite.counts.failures,
            skipped: suite.counts.skipped,
            total: suite.counts.total,
        }));

        let mut test_case_ids: HashMap<TestCaseIdentity, u64> = HashMap::new();
        for case in &suite.test_cases {
            let identity = case.identity();
            let test_case_id = match test_case_ids.get(&identity) {
                Some(id) => *id,
                None => {
                    let id = self.allocate();
                    records.push(ResultRecord::TestCase(TestCaseRecord {
                        id,
                        environment_run_id,
                        name: identity.name.clone(),
                        classname: identity.classname.clone(),
                        file: identity.file.clone(),
                        line: identity.line,
                    }));
                    test_case_ids.insert(identity, id);
                    id
                }
            };

            let outcome = match (&case.failure, case.skipped) {
                (Some(failure), _) => match failure.kind {
                    FailureKind::Failure => TestOutcome::Failed,
                    FailureKind::Error => TestOutcome::Error,
                },
                (None, true) => TestOutcome::Skipped,
                (None, false) => TestOutcome::Passed,
            };
            let test_case_run_id = self.allocate();
            records.push(ResultRecord::TestCaseRun(TestCaseRunRecord {
                id: test_case_run_id,
                suite_run_id,
                test_case_id,
                duration_secs: case.duration.map(|duration| duration.as_secs_f64()),
                outcome,
            }));

            if let Some(failure) = &case.failure {
                records.push(ResultRecord::TestFailure(TestFailureRecord {
                    id: self.allocate(),
                    test_case_run_id,
                    kind: failure.kind,
                    message: failure.message.clone(),
                    text: failure.detail_lines.join("\n"),
                }));
            }
        }
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Default for RecordFlattener {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives flattened records.
pub trait RecordSink {
    /// Writes one record.
    fn write_record(&mut self, record: &ResultRecord) -> Result<(), RecordSinkError>;

    /// Flushes anything buffered.
    fn finish(&mut self) -> Result<(), RecordSinkError>;
}

/// Flattens `run` and writes every record to `sink`, returning the number written.
pub fn write_project_run(
    flattener: &mut RecordFlattener,
    run: &ProjectRunResult,
    sink: &mut dyn RecordSink,
) -> Result<usize, RecordSinkError> {
    let records = flattener.flatten(run);
    for record in &records {
        sink.write_record(record)?;
    }
    Ok(records.len())
}

/// Writes records as JSON, one per line.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: Utf8PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    /// Creates `path`, truncating it if it exists.
    pub fn create(path: &Utf8Path) -> Result<Self, RecordSinkError> {
        let file = File::create(path).map_err(|err| RecordSinkError::Open {
            path: path.to_owned(),
            err,
        })?;
        Ok(Self {
            path: path.to_owned(),
            writer: BufWriter::new(file),
        })
    }
}

impl RecordSink for JsonLinesSink {
    fn write_record(&mut self, record: &ResultRecord) -> Result<(), RecordSinkError> {
        write_json_line(&mut self.writer, &self.path, record)
    }

    fn finish(&mut self) -> Result<(), RecordSinkError> {
        self.writer.flush().map_err(|err| RecordSinkError::Write {
            path: self.path.clone(),
            err,
        })
    }
}

fn write_json_line(
    writer: &mut impl Write,
    path: &Utf8Path,
    record: &ResultRecord,
) -> Result<(), RecordSinkError> {
    let write_error = |err: std::io::Error| RecordSinkError::Write {
        path: path.to_owned(),
        err,
    };
    serde_json::to_writer(&mut *writer, record).map_err(|err| {
        if err.is_io() {
            write_error(err.into())
        } else {
            RecordSinkError::Serialize(err)
        }
    })?;
    writer.write_all(b"\n").map_err(write_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        requirement::Requirement,
        results::{
            EnvironmentHealth, EnvironmentName, Failure, SuiteCounts, TestCaseResult,
            TestSuiteResult, ToxRunMetadata,
        },
    };
    use camino_tempfile::Utf8TempDir;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn case(name: &str, failure: Option<FailureKind>) -> TestCaseResult {
        TestCaseResult {
            name: name.to_owned(),
            classname: Some("tests.test_mod".to_owned()),
            file: None,
            line: None,
            duration: Some(Duration::from_millis(250)),
            skipped: false,
            failure: failure.map(|kind| Failure {
                kind,
                message: "boom".to_owned(),
                detail_lines: vec!["line 1".to_owned(), "line 2".to_owned()],
            }),
        }
    }

    fn project_run(dir: &Utf8Path) -> ProjectRunResult {
        let environment = EnvironmentName::new("py38").unwrap();
        ProjectRunResult {
            project_url: "https://example.com/widgets".to_owned(),
            revision: "0123456789abcdef0123456789abcdef01234567".parse().unwrap(),
            requirement: Requirement::resolve("widget==2.0", dir).unwrap(),
            environment_runs: vec![EnvironmentRunArtifacts {
                environment: environment.clone(),
                suite: TestSuiteResult {
                    environment,
                    name: "pytest".to_owned(),
                    counts: SuiteCounts {
                        errors: 1,
                        failures: 1,
                        skipped: 0,
                        total: 3,
                    },
                    duration: None,
                    timestamp: None,
                    host: None,
                    test_cases: vec![
                        case("test_a", None),
                        case("test_b", Some(FailureKind::Failure)),
                        // Same identity again, for example a rerun.
                        case("test_b", Some(FailureKind::Error)),
                    ],
                },
                runner_metadata: ToxRunMetadata::default(),
                health: EnvironmentHealth::Healthy,
            }],
            omitted: Vec::new(),
        }
    }

    #[test]
    fn flatten_links_children_to_parents() {
        let dir = Utf8TempDir::new().unwrap();
        let records = RecordFlattener::new().flatten(&project_run(dir.path()));

        let tables: Vec<_> = records.iter().map(ResultRecord::table_name).collect();
        assert_eq!(
            tables,
            [
                "project_run",
                "environment_run",
                "suite_run",
                "test_case",
                "test_case_run",
                "test_case",
                "test_case_run",
                "test_failure",
                "test_case_run",
                "test_failure",
            ]
        );

        let ids: Vec<_> = records.iter().map(ResultRecord::id).collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());

        // Both runs of test_b share one test case row.
        let test_b_runs: Vec<_> = records
            .iter()
            .filter_map(|record| match record {
                ResultRecord::TestCaseRun(run) if run.test_case_id == 6 => Some(run.outcome),
                _ => None,
            })
            .collect();
        assert_eq!(test_b_runs, [TestOutcome::Failed, TestOutcome::Error]);

        match &records[9] {
            ResultRecord::TestFailure(failure) => {
                assert_eq!(failure.test_case_run_id, 9);
                assert_eq!(failure.text, "line 1\nline 2");
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn ids_continue_across_runs() {
        let dir = Utf8TempDir::new().unwrap();
        let mut flattener = RecordFlattener::new();
        let run = project_run(dir.path());
        flattener.flatten(&run);
        let second = flattener.flatten(&run);
        assert_eq!(second[0].id(), 11);
    }

    #[test]
    fn json_lines_sink_writes_tagged_records() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("records.jsonl");
        let mut sink = JsonLinesSink::create(&path).unwrap();
        let written =
            write_project_run(&mut RecordFlattener::new(), &project_run(dir.path()), &mut sink)
                .unwrap();
        sink.finish().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), written);
        assert_eq!(lines[0]["table"], "project_run");
        assert_eq!(lines[0]["requirement"], "widget==2.0");
        assert_eq!(lines[4]["outcome"], "passed");
        assert_eq!(lines[4]["duration_secs"], 0.25);
    }

    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("no space left on device"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn io_failure_is_a_write_error() {
        let dir = Utf8TempDir::new().unwrap();
        let records = RecordFlattener::new().flatten(&project_run(dir.path()));
        let path = Utf8Path::new("records.jsonl");

        let err = write_json_line(&mut FullDisk, path, &records[0]).unwrap_err();
        match err {
            RecordSinkError::Write { path: err_path, err } => {
                assert_eq!(err_path, path);
                assert_eq!(err.to_string(), "no space left on device");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

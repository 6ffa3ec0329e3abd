// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    compare::{
        BatchComparison, BatchRun, FailureOccurrence, ProjectComparison, ProjectRun,
        RegressionReport, RunOverview,
    },
    errors::DisplayErrorChain,
    helpers::plural,
    results::{ProjectRunResult, TestCaseIdentity},
};
use owo_colors::{OwoColorize, Style};
use std::io::{self, Write};

const INDENT: &str = "    ";

/// Builder for [`Reporter`].
#[derive(Clone, Debug, Default)]
pub struct ReporterBuilder {
    hide_details: bool,
}

impl ReporterBuilder {
    /// Hides failure messages and detail lines, printing only test identities.
    pub fn set_hide_details(&mut self, hide_details: bool) -> &mut Self {
        self.hide_details = hide_details;
        self
    }

    /// Creates a new reporter.
    pub fn build(&self) -> Reporter {
        Reporter {
            hide_details: self.hide_details,
            styles: Box::default(),
        }
    }
}

/// Writes human-readable comparison output.
#[derive(Debug)]
pub struct Reporter {
    hide_details: bool,
    styles: Box<Styles>,
}

impl Reporter {
    /// Colorizes output.
    pub fn colorize(&mut self) {
        self.styles.colorize();
    }

    /// Writes every project in `batch`, followed by a one-line tally.
    pub fn write_comparison(&self, batch: &BatchComparison, mut writer: impl Write) -> io::Result<()> {
        for project in &batch.projects {
            self.write_project_comparison(batch, project, &mut writer)?;
            writeln!(writer)?;
        }
        self.write_comparison_tally(batch, &mut writer)
    }

    /// Writes the failing tests of every project in `batch`.
    pub fn write_run(&self, batch: &BatchRun, mut writer: impl Write) -> io::Result<()> {
        for project in &batch.projects {
            self.write_project_run(project, &mut writer)?;
            writeln!(writer)?;
        }

        let failed = batch
            .projects
            .iter()
            .filter(|project| project.outcome.is_err())
            .count();
        let run = batch.projects.len();
        write!(
            writer,
            "{:>12} {} {} with {}",
            "Finished".style(self.styles.pass),
            run.style(self.styles.count),
            plural::projects_str(run),
            batch.requirement,
        )?;
        if failed > 0 {
            write!(
                writer,
                ", {} {}",
                failed.style(self.styles.count),
                "failed".style(self.styles.fail)
            )?;
        }
        if batch.cancelled {
            write!(writer, " ({})", "cancelled".style(self.styles.warn))?;
        }
        writeln!(writer)
    }

    fn write_project_comparison(
        &self,
        batch: &BatchComparison,
        project: &ProjectComparison,
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        self.write_project_heading(&project.project_url, project.revision.as_ref(), writer)?;
        let compared = match &project.outcome {
            Ok(compared) => compared,
            Err(err) => {
                return writeln!(
                    writer,
                    "{INDENT}{}: {}",
                    "could not be run".style(self.styles.fail),
                    DisplayErrorChain::new(err)
                );
            }
        };
        let report = &compared.report;

        self.write_overview_warnings("base", report.base_overview(), writer)?;
        self.write_overview_warnings("new", report.new_overview(), writer)?;

        if !report.has_differences() {
            writeln!(writer, "{INDENT}{}", "No differences".style(self.styles.pass))?;
            if !report.is_conclusive() {
                writeln!(
                    writer,
                    "{INDENT}{}: at least one run produced no environments, \
                     so this comparison is inconclusive",
                    "note".style(self.styles.warn),
                )?;
            }
            return Ok(());
        }

        writeln!(
            writer,
            "{INDENT}{} between {} and {}",
            "There were differences".style(self.styles.fail),
            batch.base_requirement.style(self.styles.requirement),
            batch.new_requirement.style(self.styles.requirement),
        )?;
        self.write_failure_list(
            "Introduced",
            self.styles.fail,
            report.introduced(),
            report.new_failures().len(),
            writer,
        )?;
        self.write_failure_list(
            "Resolved",
            self.styles.pass,
            report.resolved(),
            report.base_failures().len(),
            writer,
        )?;
        self.write_unchanged(report, writer)
    }

    fn write_project_run(&self, project: &ProjectRun, writer: &mut dyn Write) -> io::Result<()> {
        let run = match &project.outcome {
            Ok(run) => run,
            Err(err) => {
                self.write_project_heading(&project.project_url, None, writer)?;
                return writeln!(
                    writer,
                    "{INDENT}{}: {}",
                    "could not be run".style(self.styles.fail),
                    DisplayErrorChain::new(err)
                );
            }
        };
        self.write_project_heading(&project.project_url, Some(&run.revision), writer)?;
        self.write_run_environments(run, writer)
    }

    fn write_run_environments(
        &self,
        run: &ProjectRunResult,
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        for env_run in &run.environment_runs {
            let failed: Vec<_> = env_run.suite.failed_cases().collect();
            let total = env_run.suite.test_cases.len();
            write!(
                writer,
                "{INDENT}{}: {} {}, ",
                env_run.environment.style(self.styles.environment),
                total.style(self.styles.count),
                plural::tests_str(total),
            )?;
            if failed.is_empty() {
                writeln!(writer, "{}", "no failures".style(self.styles.pass))?;
            } else {
                writeln!(
                    writer,
                    "{} {}",
                    failed.len().style(self.styles.count),
                    "failed".style(self.styles.fail)
                )?;
            }
            for issue in env_run.health.issues() {
                writeln!(
                    writer,
                    "{INDENT}{INDENT}{}: {issue}",
                    "unhealthy".style(self.styles.warn)
                )?;
            }
            for case in failed {
                let identity = case.identity();
                writeln!(
                    writer,
                    "{INDENT}{INDENT}{}",
                    identity.style(self.styles.test_name)
                )?;
                if let Some(failure) = &case.failure {
                    self.write_failure_detail(&failure.message, &failure.detail_lines, 3, writer)?;
                }
            }
        }
        for omitted in &run.omitted {
            writeln!(
                writer,
                "{INDENT}{}: {} {}",
                omitted.environment.style(self.styles.environment),
                "omitted".style(self.styles.warn),
                omitted.reason,
            )?;
        }
        Ok(())
    }

    fn write_project_heading(
        &self,
        project_url: &str,
        revision: Option<&crate::cache::Revision>,
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        write!(writer, "{}", project_url.style(self.styles.project))?;
        if let Some(revision) = revision {
            write!(writer, " at {}", revision.short())?;
        }
        writeln!(writer)
    }

    fn write_overview_warnings(
        &self,
        side: &str,
        overview: &RunOverview,
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        for (environment, reason) in &overview.omitted {
            writeln!(
                writer,
                "{INDENT}{}: [{side}] {} omitted: {reason}",
                "warning".style(self.styles.warn),
                environment.style(self.styles.environment),
            )?;
        }
        for environment in &overview.unhealthy {
            let action = if overview.excluded.contains(environment) {
                "excluded from the comparison"
            } else {
                "included in the comparison"
            };
            writeln!(
                writer,
                "{INDENT}{}: [{side}] {} is unhealthy, {action}",
                "warning".style(self.styles.warn),
                environment.style(self.styles.environment),
            )?;
        }
        Ok(())
    }

    fn write_failure_list<'a>(
        &self,
        heading: &str,
        style: Style,
        failures: impl Iterator<Item = (&'a TestCaseIdentity, &'a FailureOccurrence)>,
        side_total: usize,
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        let failures: Vec<_> = failures.collect();
        if failures.is_empty() {
            return Ok(());
        }
        writeln!(
            writer,
            "{INDENT}{} ({} of {side_total} failing):",
            heading.style(style),
            failures.len().style(self.styles.count),
        )?;
        for (identity, occurrence) in failures {
            write!(
                writer,
                "{INDENT}{INDENT}{} [{}]",
                identity.style(self.styles.test_name),
                occurrence.environment.style(self.styles.environment),
            )?;
            match (&identity.file, identity.line) {
                (Some(file), Some(line)) => writeln!(writer, " {file}:{line}")?,
                (Some(file), None) => writeln!(writer, " {file}")?,
                (None, _) => writeln!(writer)?,
            }
            self.write_failure_detail(
                &occurrence.failure.message,
                &occurrence.failure.detail_lines,
                3,
                writer,
            )?;
        }
        Ok(())
    }

    fn write_failure_detail(
        &self,
        message: &str,
        detail_lines: &[String],
        depth: usize,
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        if self.hide_details {
            return Ok(());
        }
        let indent = INDENT.repeat(depth);
        if !message.is_empty() {
            writeln!(writer, "{indent}{}", message.style(self.styles.fail_output))?;
        }
        for line in detail_lines {
            if line.is_empty() {
                writeln!(writer)?;
            } else {
                writeln!(writer, "{indent}{line}")?;
            }
        }
        Ok(())
    }

    fn write_unchanged(&self, report: &RegressionReport, writer: &mut dyn Write) -> io::Result<()> {
        let unchanged = report.unchanged_count();
        if unchanged > 0 {
            writeln!(
                writer,
                "{INDENT}{} {} failing with both",
                unchanged.style(self.styles.count),
                plural::tests_str(unchanged),
            )?;
        }
        Ok(())
    }

    fn write_comparison_tally(
        &self,
        batch: &BatchComparison,
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        let total = batch.projects.len();
        let failed = batch.failed_count();
        let differing = batch
            .projects
            .iter()
            .filter(|project| {
                project
                    .outcome
                    .as_ref()
                    .is_ok_and(|compared| compared.report.has_differences())
            })
            .count();
        let inconclusive = batch
            .projects
            .iter()
            .filter(|project| {
                project
                    .outcome
                    .as_ref()
                    .is_ok_and(|compared| !compared.report.is_conclusive())
            })
            .count();

        write!(
            writer,
            "{:>12} {} {}: {} with differences",
            "Compared".style(self.styles.pass),
            total.style(self.styles.count),
            plural::projects_str(total),
            differing.style(self.styles.count),
        )?;
        if inconclusive > 0 {
            write!(
                writer,
                ", {} {}",
                inconclusive.style(self.styles.count),
                "inconclusive".style(self.styles.warn)
            )?;
        }
        if failed > 0 {
            write!(
                writer,
                ", {} {}",
                failed.style(self.styles.count),
                "failed".style(self.styles.fail)
            )?;
        }
        if batch.cancelled {
            write!(writer, " ({})", "cancelled".style(self.styles.warn))?;
        }
        writeln!(writer)
    }
}

#[derive(Debug, Default)]
struct Styles {
    count: Style,
    pass: Style,
    fail: Style,
    fail_output: Style,
    warn: Style,
    project: Style,
    requirement: Style,
    environment: Style,
    test_name: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.fail_output = Style::new().magenta();
        self.warn = Style::new().yellow().bold();
        self.project = Style::new().bold().underline();
        self.requirement = Style::new().blue().bold();
        self.environment = Style::new().cyan();
        self.test_name = Style::new().bold();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compare::ComparedProject,
        env_runner::{OmitReason, OmittedEnvironment},
        errors::{CacheError, ProjectRunError},
        requirement::Requirement,
        results::{
            EnvironmentHealth, EnvironmentName, EnvironmentRunArtifacts, Failure, FailureKind,
            SuiteCounts, TestCaseResult, TestSuiteResult, ToxRunMetadata,
        },
    };
    use camino::Utf8PathBuf;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn run(requirement: &Requirement, failing: Option<&str>) -> ProjectRunResult {
        let environment = EnvironmentName::new("py38").unwrap();
        let case = TestCaseResult {
            name: "test_foo".to_owned(),
            classname: Some("tests.test_widget".to_owned()),
            file: Some("tests/test_widget.py".to_owned()),
            line: Some(7),
            duration: None,
            skipped: false,
            failure: failing.map(|message| Failure {
                kind: FailureKind::Failure,
                message: message.to_owned(),
                detail_lines: vec!["def test_foo():".to_owned(), ">   assert 2 == 1".to_owned()],
            }),
        };
        ProjectRunResult {
            project_url: "https://example.com/widgets".to_owned(),
            revision: "0123456789abcdef0123456789abcdef01234567".parse().unwrap(),
            requirement: requirement.clone(),
            environment_runs: vec![EnvironmentRunArtifacts {
                environment: environment.clone(),
                suite: TestSuiteResult {
                    environment,
                    name: "pytest".to_owned(),
                    counts: SuiteCounts::default(),
                    duration: None,
                    timestamp: None,
                    host: None,
                    test_cases: vec![case],
                },
                runner_metadata: ToxRunMetadata::default(),
                health: EnvironmentHealth::Healthy,
            }],
            omitted: vec![OmittedEnvironment {
                environment: EnvironmentName::new("py37").unwrap(),
                reason: OmitReason::ArtifactsMissing {
                    missing: vec![Utf8PathBuf::from("out/py37/test_py37.xml")],
                },
            }],
        }
    }

    fn batch(new_failure: Option<&str>) -> BatchComparison {
        let dir = Utf8TempDir::new().unwrap();
        let base_requirement = Requirement::resolve("widget==1.0", dir.path()).unwrap();
        let new_requirement = Requirement::resolve("widget==2.0", dir.path()).unwrap();
        let base_run = run(&base_requirement, None);
        let new_run = run(&new_requirement, new_failure);
        let report = RegressionReport::new(&base_run, &new_run, false);
        BatchComparison {
            projects: vec![
                ProjectComparison {
                    project_url: "https://example.com/widgets".to_owned(),
                    revision: Some(base_run.revision.clone()),
                    outcome: Ok(ComparedProject {
                        report,
                        base_run,
                        new_run,
                    }),
                },
                ProjectComparison {
                    project_url: "https://example.com/broken".to_owned(),
                    revision: None,
                    outcome: Err(ProjectRunError::Cache(CacheError::CloneFailed {
                        url: "https://example.com/broken".to_owned(),
                        exit_code: Some(128),
                        stderr: String::new(),
                    })),
                },
            ],
            base_requirement,
            new_requirement,
            cancelled: false,
        }
    }

    fn render(batch: &BatchComparison) -> String {
        render_with(batch, false)
    }

    fn render_with(batch: &BatchComparison, hide_details: bool) -> String {
        let mut out = Vec::new();
        ReporterBuilder::default()
            .set_hide_details(hide_details)
            .build()
            .write_comparison(batch, &mut out)
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn hidden_details_keep_identities() {
        assert_eq!(
            render_with(&batch(Some("AssertionError: assert 2 == 1")), true),
            indoc! {"
                https://example.com/widgets at 0123456789ab
                    warning: [base] py37 omitted: test run did not write out/py37/test_py37.xml
                    warning: [new] py37 omitted: test run did not write out/py37/test_py37.xml
                    There were differences between widget==1.0 and widget==2.0
                    Introduced (1 of 1 failing):
                        tests.test_widget::test_foo [py38] tests/test_widget.py:7

                https://example.com/broken
                    could not be run: cloning `https://example.com/broken` failed with exit code 128

                    Compared 2 projects: 1 with differences, 1 failed
            "}
        );
    }

    #[test]
    fn differences_are_listed() {
        assert_eq!(
            render(&batch(Some("AssertionError: assert 2 == 1"))),
            indoc! {"
                https://example.com/widgets at 0123456789ab
                    warning: [base] py37 omitted: test run did not write out/py37/test_py37.xml
                    warning: [new] py37 omitted: test run did not write out/py37/test_py37.xml
                    There were differences between widget==1.0 and widget==2.0
                    Introduced (1 of 1 failing):
                        tests.test_widget::test_foo [py38] tests/test_widget.py:7
                            AssertionError: assert 2 == 1
                            def test_foo():
                            >   assert 2 == 1

                https://example.com/broken
                    could not be run: cloning `https://example.com/broken` failed with exit code 128

                    Compared 2 projects: 1 with differences, 1 failed
            "}
        );
    }

    #[test]
    fn no_differences() {
        let output = render(&batch(None));
        assert!(output.contains("    No differences\n"), "output:\n{output}");
        assert!(
            output.ends_with("    Compared 2 projects: 0 with differences, 1 failed\n"),
            "output:\n{output}"
        );
    }
}

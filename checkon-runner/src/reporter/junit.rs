// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! JUnit output for a comparison: one suite per project, one failing case per introduced failure.

use crate::{
    compare::{BatchComparison, ProjectComparison},
    errors::{DisplayErrorChain, WriteReportError},
};
use atomicwrites::{AllowOverwrite, AtomicFile};
use camino::Utf8Path;
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};

/// Writes `batch` as a JUnit report to `path`, replacing any existing file atomically.
pub fn write_junit(batch: &BatchComparison, path: &Utf8Path) -> Result<(), WriteReportError> {
    let report = to_report(batch);

    if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|err| WriteReportError::Io {
            path: parent.to_owned(),
            err,
        })?;
    }
    AtomicFile::new(path, AllowOverwrite)
        .write(|file| report.serialize(file))
        .map_err(|err| match err {
            atomicwrites::Error::Internal(err) => WriteReportError::Io {
                path: path.to_owned(),
                err,
            },
            atomicwrites::Error::User(err) => WriteReportError::Junit {
                path: path.to_owned(),
                err,
            },
        })
}

fn to_report(batch: &BatchComparison) -> Report {
    let mut report = Report::new("checkon");
    report.add_test_suites(batch.projects.iter().map(|project| to_suite(batch, project)));
    report
}

fn to_suite(batch: &BatchComparison, project: &ProjectComparison) -> TestSuite {
    let mut suite = TestSuite::new(project.project_url.as_str());
    suite.add_property(("base-requirement", batch.base_requirement.install_arg()));
    suite.add_property(("new-requirement", batch.new_requirement.install_arg()));
    if let Some(revision) = &project.revision {
        suite.add_property(("revision", revision.as_str()));
    }

    let compared = match &project.outcome {
        Ok(compared) => compared,
        Err(err) => {
            let mut status = TestCaseStatus::non_success(NonSuccessKind::Error);
            status
                .set_message("project could not be run")
                .set_description(DisplayErrorChain::new(err).to_string());
            suite.add_test_case(TestCase::new("@checkon:project", status));
            return suite;
        }
    };

    let report = &compared.report;
    let mut introduced = report.introduced().peekable();
    if introduced.peek().is_none() {
        let status = if report.is_conclusive() {
            TestCaseStatus::success()
        } else {
            let mut status = TestCaseStatus::skipped();
            status.set_message("inconclusive: a run produced no environments");
            status
        };
        suite.add_test_case(TestCase::new("@checkon:no-introduced-failures", status));
    }
    for (identity, occurrence) in introduced {
        let mut status = TestCaseStatus::non_success(NonSuccessKind::Failure);
        status
            .set_message(occurrence.failure.message.as_str())
            .set_type(format!("introduced in {}", occurrence.environment))
            .set_description(occurrence.failure.detail_lines.join("\n"));
        let mut case = TestCase::new(identity.name.as_str(), status);
        if let Some(classname) = &identity.classname {
            case.set_classname(classname.as_str());
        }
        suite.add_test_case(case);
    }
    suite
}

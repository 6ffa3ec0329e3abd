// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

/// Root element for a serializable comparison across a batch of projects.
///
/// Printed by `checkon compare --message-format json`.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub struct ComparisonSummary {
    /// The baseline requirement, as resolved and installed.
    pub base_requirement: String,

    /// The candidate requirement, as resolved and installed.
    pub new_requirement: String,

    /// True if the batch was interrupted before every project finished.
    ///
    /// Projects that finished before the interruption are still listed.
    #[serde(default)]
    pub cancelled: bool,

    /// One entry per project, in the order the projects were requested.
    pub projects: Vec<ProjectComparisonSummary>,
}

impl ComparisonSummary {
    /// Creates a new, empty `ComparisonSummary`.
    pub fn new(base_requirement: impl Into<String>, new_requirement: impl Into<String>) -> Self {
        Self {
            base_requirement: base_requirement.into(),
            new_requirement: new_requirement.into(),
            cancelled: false,
            projects: Vec::new(),
        }
    }

    /// Parse JSON output from `checkon compare --message-format json`.
    pub fn parse_json(json: impl AsRef<str>) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json.as_ref())
    }

    /// Returns true if any project that completed showed a difference in failures.
    pub fn has_differences(&self) -> bool {
        self.projects.iter().any(|project| match &project.status {
            ProjectStatusSummary::Compared {
                introduced,
                resolved,
                ..
            } => !introduced.is_empty() || !resolved.is_empty(),
            ProjectStatusSummary::Failed { .. } => false,
        })
    }
}

/// The comparison result for a single downstream project.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectComparisonSummary {
    /// The repository URL the project was cloned from.
    pub project_url: String,

    /// The revision that was tested, if the clone got that far.
    pub revision: Option<String>,

    /// What happened to this project.
    #[serde(flatten)]
    pub status: ProjectStatusSummary,
}

/// Whether a project was compared, or failed before a comparison could be made.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ProjectStatusSummary {
    /// Both injected requirements were run against the project.
    #[serde(rename_all = "kebab-case")]
    Compared {
        /// Summary of the run against the baseline requirement.
        base: RunSummary,

        /// Summary of the run against the candidate requirement.
        new: RunSummary,

        /// False if either run produced no environments at all. An inconclusive comparison with
        /// no differences does not mean that nothing changed.
        conclusive: bool,

        /// Tests failing with the candidate requirement but not with the baseline.
        introduced: Vec<FailedTestSummary>,

        /// Tests failing with the baseline requirement but not with the candidate.
        resolved: Vec<FailedTestSummary>,

        /// The number of tests failing under both requirements.
        unchanged_failures: usize,
    },

    /// The project could not be run.
    Failed {
        /// The error message, including its chain of causes.
        error: String,
    },
}

/// Summary of one Environment Runner invocation.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunSummary {
    /// Environments that produced artifacts, in run order.
    pub environments: Vec<String>,

    /// Environments that were selected but produced no usable artifacts.
    #[serde(default)]
    pub omitted: Vec<OmittedEnvironmentSummary>,

    /// Environments whose setup or dependency installation reported a failure.
    #[serde(default)]
    pub unhealthy: Vec<String>,

    /// Environments whose failures were left out of the comparison because they were unhealthy.
    #[serde(default)]
    pub excluded: Vec<String>,
}

/// An environment that was selected to run but did not produce usable artifacts.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OmittedEnvironmentSummary {
    /// The environment name.
    pub environment: String,

    /// Why the environment was omitted.
    pub reason: String,
}

/// The identity of a failing test, plus its first recorded failure message.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FailedTestSummary {
    /// The test name.
    pub name: String,

    /// The class name (for pytest, the dotted module path).
    pub classname: Option<String>,

    /// The file the test is defined in.
    pub file: Option<String>,

    /// The line the test is defined on.
    pub line: Option<u32>,

    /// The failure message, if one was recorded.
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn failed(name: &str) -> FailedTestSummary {
        FailedTestSummary {
            name: name.to_owned(),
            classname: Some("tests.test_mod".to_owned()),
            file: Some("tests/test_mod.py".to_owned()),
            line: Some(12),
            message: Some("assert 1 == 2".to_owned()),
        }
    }

    fn compared(introduced: Vec<FailedTestSummary>) -> ProjectComparisonSummary {
        ProjectComparisonSummary {
            project_url: "https://example.com/a/b".to_owned(),
            revision: Some("0123456789abcdef0123456789abcdef01234567".to_owned()),
            status: ProjectStatusSummary::Compared {
                base: RunSummary {
                    environments: vec!["py38".to_owned()],
                    ..RunSummary::default()
                },
                new: RunSummary {
                    environments: vec!["py38".to_owned()],
                    ..RunSummary::default()
                },
                conclusive: true,
                introduced,
                resolved: vec![],
                unchanged_failures: 0,
            },
        }
    }

    #[test]
    fn status_is_tagged_inline() {
        let mut summary = ComparisonSummary::new("attrs==19.1", "attrs==19.2");
        summary.projects.push(ProjectComparisonSummary {
            project_url: "https://example.com/broken".to_owned(),
            revision: None,
            status: ProjectStatusSummary::Failed {
                error: "clone failed".to_owned(),
            },
        });

        let json = serde_json::to_value(&summary).expect("serialization succeeds");
        assert_eq!(json["projects"][0]["status"], "failed");
        assert_eq!(json["projects"][0]["error"], "clone failed");
        assert_eq!(json["base-requirement"], "attrs==19.1");

        let parsed = ComparisonSummary::parse_json(json.to_string()).expect("parse succeeds");
        assert_eq!(parsed, summary);
    }

    #[test_case(vec![], false ; "no introduced failures")]
    #[test_case(vec![failed("test_foo")], true ; "one introduced failure")]
    fn has_differences(introduced: Vec<FailedTestSummary>, expected: bool) {
        let mut summary = ComparisonSummary::new("a", "b");
        summary.projects.push(compared(introduced));
        assert_eq!(summary.has_differences(), expected);
    }
}

// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running projects against two injected requirements and diffing their failure sets.

use crate::{
    cache::{Checkout, Revision, WorkspaceCache},
    env_runner::EnvironmentRunner,
    errors::{DisplayErrorChain, ProjectRunError, RequirementResolveError},
    helpers::{plural, slugify},
    requirement::Requirement,
    results::{
        EnvironmentName, EnvironmentRunArtifacts, Failure, ProjectRunResult, TestCaseIdentity,
    },
    signal::ShutdownHandler,
};
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use checkon_metadata::{
    ComparisonSummary, FailedTestSummary, OmittedEnvironmentSummary, ProjectComparisonSummary,
    ProjectStatusSummary, RunSummary,
};
use chrono::Utc;
use futures::prelude::*;
use std::{collections::BTreeMap, num::NonZeroUsize};
use tracing::{debug, info, warn};

/// The failing tests of one run, keyed by identity.
///
/// The same identity failing in several environments is one entry. The first failure seen is kept
/// for display, and is not part of equality.
#[derive(Clone, Debug, Default)]
pub struct FailureSet {
    failures: BTreeMap<TestCaseIdentity, FailureOccurrence>,
}

/// Where a failing test was first seen, and how it failed there.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FailureOccurrence {
    /// The environment the failure was first seen in.
    pub environment: EnvironmentName,
    /// The recorded failure.
    pub failure: Failure,
}

impl FailureSet {
    /// Collects the failures of every suite in `runs`.
    pub fn from_runs<'a>(runs: impl IntoIterator<Item = &'a EnvironmentRunArtifacts>) -> Self {
        let mut failures = BTreeMap::new();
        for run in runs {
            for case in &run.suite.test_cases {
                if let Some(failure) = &case.failure {
                    failures
                        .entry(case.identity())
                        .or_insert_with(|| FailureOccurrence {
                            environment: run.environment.clone(),
                            failure: failure.clone(),
                        });
                }
            }
        }
        Self { failures }
    }

    /// The number of distinct failing tests.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Returns true if nothing failed.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Returns true if `identity` failed.
    pub fn contains(&self, identity: &TestCaseIdentity) -> bool {
        self.failures.contains_key(identity)
    }

    /// Returns the occurrence recorded for `identity`.
    pub fn get(&self, identity: &TestCaseIdentity) -> Option<&FailureOccurrence> {
        self.failures.get(identity)
    }

    /// Iterates over failures in identity order.
    pub fn iter(&self) -> impl Iterator<Item = (&TestCaseIdentity, &FailureOccurrence)> + '_ {
        self.failures.iter()
    }

    /// Failures in `self` that are not in `other`, in identity order.
    pub fn difference<'a>(
        &'a self,
        other: &'a FailureSet,
    ) -> impl Iterator<Item = (&'a TestCaseIdentity, &'a FailureOccurrence)> + 'a {
        self.failures
            .iter()
            .filter(move |(identity, _)| !other.contains(identity))
    }

    /// The number of identities in both sets.
    pub fn intersection_count(&self, other: &FailureSet) -> usize {
        self.failures
            .keys()
            .filter(|identity| other.contains(identity))
            .count()
    }
}

impl PartialEq for FailureSet {
    fn eq(&self, other: &Self) -> bool {
        self.failures.keys().eq(other.failures.keys())
    }
}

impl Eq for FailureSet {}

/// What one side of a comparison ran.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunOverview {
    /// Environments that produced artifacts, in run order.
    pub environments: Vec<EnvironmentName>,
    /// Environments that were selected but produced nothing usable, with the reason.
    pub omitted: Vec<(EnvironmentName, String)>,
    /// Environments whose setup or install had problems.
    pub unhealthy: Vec<EnvironmentName>,
    /// Unhealthy environments whose failures were left out.
    pub excluded: Vec<EnvironmentName>,
}

impl RunOverview {
    fn new(run: &ProjectRunResult, exclude_unhealthy: bool) -> Self {
        let unhealthy: Vec<_> = run
            .environment_runs
            .iter()
            .filter(|env_run| !env_run.health.is_healthy())
            .map(|env_run| env_run.environment.clone())
            .collect();
        Self {
            environments: run
                .environment_runs
                .iter()
                .map(|env_run| env_run.environment.clone())
                .collect(),
            omitted: run
                .omitted
                .iter()
                .map(|omitted| (omitted.environment.clone(), omitted.reason.to_string()))
                .collect(),
            excluded: if exclude_unhealthy {
                unhealthy.clone()
            } else {
                Vec::new()
            },
            unhealthy,
        }
    }

    fn to_summary(&self) -> RunSummary {
        RunSummary {
            environments: self.environments.iter().map(ToString::to_string).collect(),
            omitted: self
                .omitted
                .iter()
                .map(|(environment, reason)| OmittedEnvironmentSummary {
                    environment: environment.to_string(),
                    reason: reason.clone(),
                })
                .collect(),
            unhealthy: self.unhealthy.iter().map(ToString::to_string).collect(),
            excluded: self.excluded.iter().map(ToString::to_string).collect(),
        }
    }
}

/// The diff between the failure sets of a base run and a new run of one project.
#[derive(Clone, Debug)]
pub struct RegressionReport {
    project_url: String,
    base_requirement: Requirement,
    new_requirement: Requirement,
    base_failures: FailureSet,
    new_failures: FailureSet,
    base_overview: RunOverview,
    new_overview: RunOverview,
}

impl RegressionReport {
    /// Builds a report from the two runs of one project.
    ///
    /// With `exclude_unhealthy`, unhealthy environments contribute no failures.
    pub fn new(base: &ProjectRunResult, new: &ProjectRunResult, exclude_unhealthy: bool) -> Self {
        let failures = |run: &ProjectRunResult| {
            FailureSet::from_runs(
                run.environment_runs
                    .iter()
                    .filter(|env_run| !exclude_unhealthy || env_run.health.is_healthy()),
            )
        };
        Self {
            project_url: new.project_url.clone(),
            base_requirement: base.requirement.clone(),
            new_requirement: new.requirement.clone(),
            base_failures: failures(base),
            new_failures: failures(new),
            base_overview: RunOverview::new(base, exclude_unhealthy),
            new_overview: RunOverview::new(new, exclude_unhealthy),
        }
    }

    /// The project the report is for.
    pub fn project_url(&self) -> &str {
        &self.project_url
    }

    /// The baseline requirement.
    pub fn base_requirement(&self) -> &Requirement {
        &self.base_requirement
    }

    /// The candidate requirement.
    pub fn new_requirement(&self) -> &Requirement {
        &self.new_requirement
    }

    /// Failures with the baseline requirement.
    pub fn base_failures(&self) -> &FailureSet {
        &self.base_failures
    }

    /// Failures with the candidate requirement.
    pub fn new_failures(&self) -> &FailureSet {
        &self.new_failures
    }

    /// What the baseline run covered.
    pub fn base_overview(&self) -> &RunOverview {
        &self.base_overview
    }

    /// What the candidate run covered.
    pub fn new_overview(&self) -> &RunOverview {
        &self.new_overview
    }

    /// Tests failing with the candidate requirement but not the baseline.
    pub fn introduced(&self) -> impl Iterator<Item = (&TestCaseIdentity, &FailureOccurrence)> {
        self.new_failures.difference(&self.base_failures)
    }

    /// Tests failing with the baseline requirement but not the candidate.
    pub fn resolved(&self) -> impl Iterator<Item = (&TestCaseIdentity, &FailureOccurrence)> {
        self.base_failures.difference(&self.new_failures)
    }

    /// The number of tests failing with both requirements.
    pub fn unchanged_count(&self) -> usize {
        self.base_failures.intersection_count(&self.new_failures)
    }

    /// Returns true if the failure sets differ.
    pub fn has_differences(&self) -> bool {
        self.base_failures != self.new_failures
    }

    /// Returns false if either run produced no environments at all, in which case "no
    /// differences" means nothing.
    pub fn is_conclusive(&self) -> bool {
        !self.base_overview.environments.is_empty() && !self.new_overview.environments.is_empty()
    }

    fn to_status_summary(&self) -> ProjectStatusSummary {
        ProjectStatusSummary::Compared {
            base: self.base_overview.to_summary(),
            new: self.new_overview.to_summary(),
            conclusive: self.is_conclusive(),
            introduced: self.introduced().map(failed_test_summary).collect(),
            resolved: self.resolved().map(failed_test_summary).collect(),
            unchanged_failures: self.unchanged_count(),
        }
    }
}

fn failed_test_summary(
    (identity, occurrence): (&TestCaseIdentity, &FailureOccurrence),
) -> FailedTestSummary {
    let message = &occurrence.failure.message;
    FailedTestSummary {
        name: identity.name.clone(),
        classname: identity.classname.clone(),
        file: identity.file.clone(),
        line: identity.line,
        message: (!message.is_empty()).then(|| message.clone()),
    }
}

/// Both runs of one project, and their diff.
#[derive(Debug)]
pub struct ComparedProject {
    /// The diff.
    pub report: RegressionReport,
    /// The run with the baseline requirement.
    pub base_run: ProjectRunResult,
    /// The run with the candidate requirement.
    pub new_run: ProjectRunResult,
}

/// The outcome of comparing one project.
#[derive(Debug)]
pub struct ProjectComparison {
    /// The repository URL.
    pub project_url: String,
    /// The revision, if the checkout got that far.
    pub revision: Option<Revision>,
    /// The comparison, or why the project could not be run.
    pub outcome: Result<ComparedProject, ProjectRunError>,
}

/// The outcome of comparing a batch of projects.
#[derive(Debug)]
pub struct BatchComparison {
    /// The baseline requirement.
    pub base_requirement: Requirement,
    /// The candidate requirement.
    pub new_requirement: Requirement,
    /// Projects that finished, in the order they were requested.
    pub projects: Vec<ProjectComparison>,
    /// True if the batch was interrupted.
    pub cancelled: bool,
}

impl BatchComparison {
    /// Returns true if any compared project's failure sets differ.
    pub fn has_differences(&self) -> bool {
        self.projects.iter().any(|project| {
            project
                .outcome
                .as_ref()
                .is_ok_and(|compared| compared.report.has_differences())
        })
    }

    /// The number of projects that could not be run.
    pub fn failed_count(&self) -> usize {
        self.projects
            .iter()
            .filter(|project| project.outcome.is_err())
            .count()
    }

    /// Converts to the machine-readable summary.
    pub fn to_summary(&self) -> ComparisonSummary {
        let mut summary = ComparisonSummary::new(
            self.base_requirement.install_arg(),
            self.new_requirement.install_arg(),
        );
        summary.cancelled = self.cancelled;
        summary.projects = self
            .projects
            .iter()
            .map(|project| ProjectComparisonSummary {
                project_url: project.project_url.clone(),
                revision: project.revision.as_ref().map(ToString::to_string),
                status: match &project.outcome {
                    Ok(compared) => compared.report.to_status_summary(),
                    Err(err) => ProjectStatusSummary::Failed {
                        error: DisplayErrorChain::new(err).to_string(),
                    },
                },
            })
            .collect();
        summary
    }
}

/// The outcome of running one project with a single requirement.
#[derive(Debug)]
pub struct ProjectRun {
    /// The repository URL.
    pub project_url: String,
    /// The run, or why the project could not be run.
    pub outcome: Result<ProjectRunResult, ProjectRunError>,
}

/// The outcome of running a batch of projects with a single requirement.
#[derive(Debug)]
pub struct BatchRun {
    /// The injected requirement.
    pub requirement: Requirement,
    /// Projects that finished, in the order they were requested.
    pub projects: Vec<ProjectRun>,
    /// True if the batch was interrupted.
    pub cancelled: bool,
}

/// A builder for [`Comparator`].
#[derive(Clone, Debug, Default)]
pub struct ComparatorBuilder {
    project_jobs: Option<NonZeroUsize>,
    exclude_unhealthy: bool,
    artifacts_dir: Option<Utf8PathBuf>,
}

impl ComparatorBuilder {
    /// Sets the number of projects to run at once.
    pub fn set_project_jobs(&mut self, jobs: NonZeroUsize) -> &mut Self {
        self.project_jobs = Some(jobs);
        self
    }

    /// Sets whether unhealthy environments are left out of the failure diff.
    pub fn set_exclude_unhealthy(&mut self, exclude: bool) -> &mut Self {
        self.exclude_unhealthy = exclude;
        self
    }

    /// Keeps per-run artifacts under `dir` instead of a temporary directory.
    pub fn set_artifacts_dir(&mut self, dir: impl Into<Utf8PathBuf>) -> &mut Self {
        self.artifacts_dir = Some(dir.into());
        self
    }

    /// Creates a new comparator.
    pub fn build(self, cache: WorkspaceCache, runner: EnvironmentRunner) -> Comparator {
        Comparator {
            cache,
            runner,
            project_jobs: self.project_jobs.unwrap_or(NonZeroUsize::MIN),
            exclude_unhealthy: self.exclude_unhealthy,
            artifacts_dir: self.artifacts_dir,
        }
    }
}

/// Runs batches of projects through the cache and the environment runner.
#[derive(Debug)]
pub struct Comparator {
    cache: WorkspaceCache,
    runner: EnvironmentRunner,
    project_jobs: NonZeroUsize,
    exclude_unhealthy: bool,
    artifacts_dir: Option<Utf8PathBuf>,
}

impl Comparator {
    /// Runs every project once with `inject_base` and once with `inject_new`, and diffs the two
    /// failure sets of each.
    ///
    /// Both requirements are resolved against `cwd` before anything runs. A project that cannot
    /// be run is reported in place and does not stop the others. If `shutdown` fires, in-flight
    /// projects are abandoned and the batch is marked cancelled.
    pub async fn compare(
        &self,
        project_urls: &[String],
        inject_new: &str,
        inject_base: &str,
        cwd: &Utf8Path,
        shutdown: &mut ShutdownHandler,
    ) -> Result<BatchComparison, RequirementResolveError> {
        let new_requirement = Requirement::resolve(inject_new, cwd)?;
        let base_requirement = Requirement::resolve(inject_base, cwd)?;
        let run_id = new_run_id();
        info!(
            "comparing {} {}: base {base_requirement}, new {new_requirement}",
            project_urls.len(),
            plural::projects_str(project_urls.len()),
        );

        let (base, new, run_id) = (&base_requirement, &new_requirement, run_id.as_str());
        let (projects, cancelled) = self
            .run_projects(project_urls, shutdown, |url| {
                self.compare_project(url, base, new, run_id)
            })
            .await;

        Ok(BatchComparison {
            base_requirement,
            new_requirement,
            projects,
            cancelled,
        })
    }

    /// Runs every project once with `inject`.
    pub async fn run_many(
        &self,
        project_urls: &[String],
        inject: &str,
        cwd: &Utf8Path,
        shutdown: &mut ShutdownHandler,
    ) -> Result<BatchRun, RequirementResolveError> {
        let requirement = Requirement::resolve(inject, cwd)?;
        let run_id = new_run_id();
        info!(
            "running {} {} with {requirement}",
            project_urls.len(),
            plural::projects_str(project_urls.len()),
        );

        let (req, run_id) = (&requirement, run_id.as_str());
        let (projects, cancelled) = self
            .run_projects(project_urls, shutdown, |url| async move {
                let outcome = self.run_project(url, req, run_id).await;
                ProjectRun {
                    project_url: url.to_owned(),
                    outcome,
                }
            })
            .await;

        Ok(BatchRun {
            requirement,
            projects,
            cancelled,
        })
    }

    async fn run_projects<'a, T, F, Fut>(
        &self,
        project_urls: &'a [String],
        shutdown: &mut ShutdownHandler,
        run: F,
    ) -> (Vec<T>, bool)
    where
        F: Fn(&'a str) -> Fut,
        Fut: Future<Output = T>,
    {
        let total = project_urls.len();
        let mut finished: Vec<Option<T>> = std::iter::repeat_with(|| None).take(total).collect();
        let mut pending = stream::iter(project_urls.iter().enumerate())
            .map(|(index, url)| run(url.as_str()).map(move |outcome| (index, outcome)))
            .buffer_unordered(self.project_jobs.get());

        let mut done = 0;
        let mut cancelled = false;
        let mut shutdown_done = false;
        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some((index, outcome)) => {
                        done += 1;
                        debug!("[{done}/{total}] finished {}", project_urls[index]);
                        finished[index] = Some(outcome);
                    }
                    None => break,
                },
                event = shutdown.recv(), if !shutdown_done => match event {
                    Some(event) => {
                        warn!(
                            "received {}, cancelling {} unfinished {}",
                            event.name(),
                            total - done,
                            plural::projects_str(total - done),
                        );
                        cancelled = true;
                        break;
                    }
                    None => shutdown_done = true,
                },
            }
        }
        // Dropping the in-flight futures kills their child processes and removes their output.
        drop(pending);

        (finished.into_iter().flatten().collect(), cancelled)
    }

    async fn compare_project(
        &self,
        project_url: &str,
        base: &Requirement,
        new: &Requirement,
        run_id: &str,
    ) -> ProjectComparison {
        let checkout = match self.cache.acquire(project_url).await {
            Ok(checkout) => checkout,
            Err(err) => {
                warn!("{project_url}: {}", DisplayErrorChain::new(&err));
                return ProjectComparison {
                    project_url: project_url.to_owned(),
                    revision: None,
                    outcome: Err(err.into()),
                };
            }
        };
        let revision = checkout.revision().clone();

        let outcome = self
            .compare_checkout(&checkout, project_url, base, new, run_id)
            .await;
        if let Err(err) = &outcome {
            warn!("{project_url}: {}", DisplayErrorChain::new(err));
        }

        ProjectComparison {
            project_url: project_url.to_owned(),
            revision: Some(revision),
            outcome,
        }
    }

    async fn compare_checkout(
        &self,
        checkout: &Checkout,
        project_url: &str,
        base: &Requirement,
        new: &Requirement,
        run_id: &str,
    ) -> Result<ComparedProject, ProjectRunError> {
        let mut output_root = self.output_root(run_id, project_url)?;
        let base_run = self
            .run_side(checkout, project_url, base, &output_root.path().join("base"))
            .await?;
        let new_run = self
            .run_side(checkout, project_url, new, &output_root.path().join("new"))
            .await?;
        output_root.finish();
        let report = RegressionReport::new(&base_run, &new_run, self.exclude_unhealthy);
        Ok(ComparedProject {
            report,
            base_run,
            new_run,
        })
    }

    async fn run_project(
        &self,
        project_url: &str,
        requirement: &Requirement,
        run_id: &str,
    ) -> Result<ProjectRunResult, ProjectRunError> {
        let checkout = self.cache.acquire(project_url).await?;
        let mut output_root = self.output_root(run_id, project_url)?;
        let run = self
            .run_side(&checkout, project_url, requirement, output_root.path())
            .await?;
        output_root.finish();
        Ok(run)
    }

    async fn run_side(
        &self,
        checkout: &Checkout,
        project_url: &str,
        requirement: &Requirement,
        output_root: &Utf8Path,
    ) -> Result<ProjectRunResult, ProjectRunError> {
        let set = self.runner.run(checkout, requirement, output_root).await?;
        Ok(ProjectRunResult {
            project_url: project_url.to_owned(),
            revision: checkout.revision().clone(),
            requirement: requirement.clone(),
            environment_runs: set.environment_runs,
            omitted: set.omitted,
        })
    }

    fn output_root(&self, run_id: &str, project_url: &str) -> Result<OutputRoot, ProjectRunError> {
        match &self.artifacts_dir {
            Some(dir) => {
                let path = dir.join(run_id).join(slugify(project_url));
                std::fs::create_dir_all(&path).map_err(|err| ProjectRunError::OutputRoot {
                    path: path.clone(),
                    err,
                })?;
                Ok(OutputRoot::Persistent {
                    path,
                    finished: false,
                })
            }
            None => {
                let dir = camino_tempfile::Builder::new()
                    .prefix("checkon-")
                    .tempdir()
                    .map_err(|err| ProjectRunError::OutputRoot {
                        path: Utf8PathBuf::from(std::env::temp_dir().to_string_lossy().into_owned()),
                        err,
                    })?;
                Ok(OutputRoot::Temp(dir))
            }
        }
    }
}

fn new_run_id() -> String {
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        std::process::id()
    )
}

/// Where one project's artifacts are written.
///
/// Temporary roots are always removed on drop. Persistent roots are removed on drop unless the
/// project finished.
#[derive(Debug)]
enum OutputRoot {
    Temp(Utf8TempDir),
    Persistent { path: Utf8PathBuf, finished: bool },
}

impl OutputRoot {
    fn path(&self) -> &Utf8Path {
        match self {
            Self::Temp(dir) => dir.path(),
            Self::Persistent { path, .. } => path,
        }
    }

    fn finish(&mut self) {
        if let Self::Persistent { finished, .. } = self {
            *finished = true;
        }
    }
}

impl Drop for OutputRoot {
    fn drop(&mut self) {
        if let Self::Persistent {
            path,
            finished: false,
        } = self
        {
            debug!("removing unfinished artifacts at {path}");
            if let Err(err) = std::fs::remove_dir_all(&*path) {
                debug!("failed to remove {path}: {err}");
            }
        }
    }
}

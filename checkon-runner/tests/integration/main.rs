// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end runs against fake `git` and `tox` executables.

#![cfg(unix)]

mod fixtures;

use checkon_metadata::ProjectStatusSummary;
use checkon_runner::{
    compare::BatchComparison,
    errors::{CacheError, ProjectRunError},
    reporter::{ReporterBuilder, write_junit},
    results::EnvironmentName,
    signal::ShutdownHandlerKind,
    sink::{JsonLinesSink, RecordFlattener, RecordSink, write_project_run},
};
use color_eyre::eyre::{Result, eyre};
use fixtures::*;
use pretty_assertions::assert_eq;

async fn compare(sandbox: &Sandbox, artifacts: bool) -> Result<BatchComparison> {
    let artifacts_dir = sandbox.artifacts_dir();
    let comparator = sandbox.comparator(|builder| {
        if artifacts {
            builder.set_artifacts_dir(artifacts_dir);
        }
    })?;
    let mut shutdown = ShutdownHandlerKind::Noop.build()?;
    Ok(comparator
        .compare(
            &[PROJECT_URL.to_owned()],
            "widget==2.0",
            "widget==1.0",
            sandbox.root(),
            &mut shutdown,
        )
        .await?)
}

fn introduced_names(batch: &BatchComparison) -> Result<Vec<String>> {
    let project = batch
        .projects
        .first()
        .ok_or_else(|| eyre!("no projects in batch"))?;
    let compared = project
        .outcome
        .as_ref()
        .map_err(|err| eyre!("project failed: {err}"))?;
    Ok(compared
        .report
        .introduced()
        .map(|(identity, _)| identity.name.clone())
        .collect())
}

#[tokio::test]
async fn compare_finds_introduced_failure() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let batch = compare(&sandbox, false).await?;

    assert!(!batch.cancelled);
    assert!(batch.has_differences());
    assert_eq!(batch.failed_count(), 0);
    assert_eq!(introduced_names(&batch)?, ["test_foo"]);

    let project = &batch.projects[0];
    assert_eq!(
        project.revision.as_ref().map(|revision| revision.as_str()),
        Some(REVISION)
    );
    let compared = project.outcome.as_ref().map_err(|err| eyre!("{err}"))?;
    let (_, occurrence) = compared
        .report
        .introduced()
        .next()
        .ok_or_else(|| eyre!("no introduced failure"))?;
    assert_eq!(occurrence.environment, EnvironmentName::new("py38")?);
    assert_eq!(occurrence.failure.message, "assert 2 == 1");
    assert_eq!(compared.report.resolved().count(), 0);
    assert_eq!(
        compared.report.new_overview().environments,
        [EnvironmentName::new("py37")?, EnvironmentName::new("py38")?]
    );

    assert_eq!(sandbox.setup_count(), 1, "setup runs once per revision");
    Ok(())
}

#[tokio::test]
async fn second_run_reuses_checkout() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let first = compare(&sandbox, false).await?;
    let second = compare(&sandbox, false).await?;

    assert_eq!(introduced_names(&first)?, introduced_names(&second)?);
    assert_eq!(sandbox.setup_count(), 1, "setup is not repeated for a cached revision");

    let summary = second.to_summary();
    match &summary.projects[0].status {
        ProjectStatusSummary::Compared { .. } => {}
        other => panic!("unexpected status: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn unreachable_project_does_not_stop_batch() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let comparator = sandbox.comparator(|_| {})?;
    let mut shutdown = ShutdownHandlerKind::Noop.build()?;
    let batch = comparator
        .compare(
            &[MISSING_URL.to_owned(), PROJECT_URL.to_owned()],
            "widget==2.0",
            "widget==1.0",
            sandbox.root(),
            &mut shutdown,
        )
        .await?;

    assert_eq!(batch.projects.len(), 2);
    assert_eq!(batch.failed_count(), 1);
    assert_eq!(batch.projects[0].project_url, MISSING_URL);
    assert!(batch.projects[0].revision.is_none());
    match &batch.projects[0].outcome {
        Err(ProjectRunError::Cache(CacheError::CloneFailed { exit_code, .. })) => {
            assert_eq!(*exit_code, Some(128));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(batch.projects[1].outcome.is_ok());
    assert!(batch.has_differences());
    Ok(())
}

#[tokio::test]
async fn artifacts_and_outputs_are_written() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let batch = compare(&sandbox, true).await?;

    let run_dirs: Vec<_> = sandbox
        .artifacts_dir()
        .read_dir_utf8()?
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(run_dirs.len(), 1, "one directory per run");

    let junit = sandbox.root().join("out/checkon.xml");
    write_junit(&batch, &junit)?;
    let xml = std::fs::read_to_string(&junit)?;
    assert!(xml.contains(r#"name="test_foo""#), "{xml}");

    let records_path = sandbox.root().join("records.jsonl");
    let mut sink = JsonLinesSink::create(&records_path)?;
    let mut flattener = RecordFlattener::new();
    let compared = batch.projects[0]
        .outcome
        .as_ref()
        .map_err(|err| eyre!("{err}"))?;
    let written = write_project_run(&mut flattener, &compared.base_run, &mut sink)?
        + write_project_run(&mut flattener, &compared.new_run, &mut sink)?;
    sink.finish()?;
    let lines = std::fs::read_to_string(&records_path)?.lines().count();
    assert_eq!(lines, written);

    let mut out = Vec::new();
    let reporter = ReporterBuilder::default().build();
    reporter.write_comparison(&batch, &mut out)?;
    let out = String::from_utf8(out)?;
    assert!(out.contains("There were differences"), "{out}");
    Ok(())
}

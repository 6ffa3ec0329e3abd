// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    ExpectedError, Result,
    output::{OutputContext, OutputOpts, clap_styles},
};
use camino::{Utf8Path, Utf8PathBuf};
use checkon_metadata::CheckonExitCode;
use checkon_runner::{
    cache::{WorkspaceCache, default_cache_dir},
    compare::{BatchComparison, BatchRun, Comparator, ComparatorBuilder},
    config::CheckonConfig,
    discovery::{DEFAULT_LIMIT, DependentsClient},
    env_filter::{EnvironmentFilter, TOXENV_ENV},
    env_runner::EnvironmentRunner,
    reporter::{Reporter, ReporterBuilder, write_junit},
    results::ProjectRunResult,
    signal::ShutdownHandlerKind,
    sink::{JsonLinesSink, RecordFlattener, RecordSink, write_project_run},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::{
    io::{BufWriter, Write},
    num::NonZeroUsize,
};
use tracing::{debug, info};

/// Run the test suites of downstream projects against two versions of a dependency, and report
/// the failures the new version introduces.
#[derive(Debug, Parser)]
#[command(
    name = "checkon",
    version,
    styles = clap_styles::style(),
    max_term_width = 100
)]
pub struct CheckonApp {
    #[clap(flatten)]
    output: OutputOpts,

    #[clap(flatten)]
    config_opts: ConfigOpts,

    #[clap(subcommand)]
    command: Command,
}

impl CheckonApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, returning the process exit code.
    pub fn exec(self, output: OutputContext) -> Result<i32> {
        match self.command {
            Command::Compare {
                inject_new,
                inject_base,
                projects,
                run_opts,
                message_format,
                junit,
            } => {
                let app = BaseApp::new(output, &self.config_opts, &run_opts)?;
                let project_urls = projects.resolve()?;
                app.exec_compare(
                    &project_urls,
                    &inject_new,
                    &inject_base,
                    message_format,
                    junit.as_deref(),
                    run_opts.record_to.as_deref(),
                )
            }
            Command::Run {
                inject,
                projects,
                run_opts,
            } => {
                let app = BaseApp::new(output, &self.config_opts, &run_opts)?;
                let project_urls = projects.resolve()?;
                app.exec_run(&project_urls, &inject, run_opts.record_to.as_deref())
            }
            Command::Dependents {
                package,
                api_key,
                limit,
            } => exec_dependents(&package, &api_key, limit),
        }
    }
}

#[derive(Debug, Args)]
struct ConfigOpts {
    /// Config file [default: checkon.toml in the current directory]
    #[arg(long, global = true, value_name = "PATH", env = "CHECKON_CONFIG_FILE")]
    config_file: Option<Utf8PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compare test failures between two versions of a dependency
    ///
    /// Each project is run once with the base requirement and once with the new one. Tests that
    /// fail only with the new requirement are reported as introduced.
    Compare {
        /// The requirement under test: a version specifier, a local path or a URL
        #[arg(long, value_name = "REQ")]
        inject_new: String,

        /// The requirement to compare against
        #[arg(long, value_name = "REQ")]
        inject_base: String,

        #[clap(flatten)]
        projects: ProjectOpts,

        #[clap(flatten)]
        run_opts: RunOpts,

        /// Output format for the comparison
        #[arg(
            long,
            value_enum,
            default_value_t,
            value_name = "FMT",
            help_heading = "Output options"
        )]
        message_format: MessageFormat,

        /// Also write a JUnit report of introduced failures to this path
        #[arg(long, value_name = "PATH", help_heading = "Output options")]
        junit: Option<Utf8PathBuf>,
    },

    /// Run projects with a single requirement and list their failing tests
    Run {
        /// The requirement to install: a version specifier, a local path or a URL
        #[arg(long, value_name = "REQ")]
        inject: String,

        #[clap(flatten)]
        projects: ProjectOpts,

        #[clap(flatten)]
        run_opts: RunOpts,
    },

    /// Print the repository URLs of packages that depend on a package
    Dependents {
        /// The package to look up
        package: String,

        /// API key for the dependents directory
        #[arg(long, env = "LIBRARIES_IO_API_KEY", hide_env_values = true)]
        api_key: String,

        /// The maximum number of dependents to request
        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
    },
}

#[derive(Debug, Args)]
struct ProjectOpts {
    /// Repository URLs of the projects to run
    #[arg(value_name = "URL")]
    urls: Vec<String>,

    /// Also run the repositories of packages that depend on this package
    #[arg(
        long,
        value_name = "PACKAGE",
        requires = "api_key",
        help_heading = "Project selection"
    )]
    dependents_of: Option<String>,

    /// API key for the dependents directory
    #[arg(
        long,
        env = "LIBRARIES_IO_API_KEY",
        hide_env_values = true,
        help_heading = "Project selection"
    )]
    api_key: Option<String>,

    /// The maximum number of dependents to request
    #[arg(
        long,
        default_value_t = DEFAULT_LIMIT,
        value_name = "N",
        help_heading = "Project selection"
    )]
    dependents_limit: usize,
}

impl ProjectOpts {
    fn resolve(self) -> Result<Vec<String>> {
        let mut urls = self.urls;
        if let (Some(package), Some(api_key)) = (&self.dependents_of, &self.api_key) {
            let dependents = DependentsClient::new()
                .fetch(package, api_key, self.dependents_limit)
                .map_err(|err| ExpectedError::DiscoveryError {
                    package: package.clone(),
                    err,
                })?;
            info!("found {} dependents of {package}", dependents.len());
            urls.extend(dependents);
        }
        if urls.is_empty() {
            return Err(ExpectedError::NoProjects);
        }
        Ok(urls)
    }
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Run options")]
struct RunOpts {
    /// Only run environments whose names contain one of these fragments [default: $TOXENV, or all]
    #[arg(long = "env", short = 'e', value_name = "FRAGMENT", value_delimiter = ',')]
    envs: Vec<String>,

    /// Number of projects to run at the same time
    #[arg(long, short = 'j', value_name = "N", env = "CHECKON_PROJECT_JOBS")]
    project_jobs: Option<NonZeroUsize>,

    /// Number of environments within one project to run at the same time
    #[arg(long, value_name = "N", env = "CHECKON_ENV_JOBS")]
    env_jobs: Option<NonZeroUsize>,

    /// Leave environments whose setup or install failed out of the comparison
    #[arg(long)]
    exclude_unhealthy: bool,

    /// Keep per-environment artifacts under this directory
    #[arg(long, value_name = "DIR")]
    artifacts_dir: Option<Utf8PathBuf>,

    /// Write flattened result records to this path, as JSON lines
    #[arg(long, value_name = "PATH")]
    record_to: Option<Utf8PathBuf>,

    /// Print only failing test identities, without messages or details
    #[arg(long)]
    hide_details: bool,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
enum MessageFormat {
    /// A human-readable report.
    #[default]
    Human,
    /// The comparison summary as JSON with no whitespace.
    Json,
    /// The comparison summary as prettified JSON.
    JsonPretty,
}

struct BaseApp {
    output: OutputContext,
    cwd: Utf8PathBuf,
    comparator: Comparator,
    hide_details: bool,
}

impl BaseApp {
    fn new(output: OutputContext, config_opts: &ConfigOpts, run_opts: &RunOpts) -> Result<Self> {
        let cwd = current_dir()?;
        let config = CheckonConfig::from_sources(&cwd, config_opts.config_file.as_deref())?;
        if let Some(config_file) = config.config_file() {
            debug!("loaded config from {config_file}");
        }

        let cache_dir = match config.cache_dir() {
            Some(cache_dir) => cache_dir.to_owned(),
            None => default_cache_dir()?,
        };
        debug!("using cache at {cache_dir}");
        let cache = WorkspaceCache::new(cache_dir, config.git_program())
            .map_err(|err| ExpectedError::CacheOpenError { err })?;

        let toxenv = std::env::var(TOXENV_ENV).ok();
        let filter = EnvironmentFilter::from_fragments_or_env(&run_opts.envs, toxenv.as_deref())?;
        let runner = EnvironmentRunner::new(
            config.tool().clone(),
            filter,
            run_opts.env_jobs.unwrap_or(config.env_jobs()),
        );

        let mut builder = ComparatorBuilder::default();
        builder
            .set_project_jobs(run_opts.project_jobs.unwrap_or(config.project_jobs()))
            .set_exclude_unhealthy(run_opts.exclude_unhealthy || config.exclude_unhealthy());
        let artifacts_dir = match &run_opts.artifacts_dir {
            Some(dir) => Some(cwd.join(dir)),
            None => config.artifacts_dir().map(Utf8Path::to_owned),
        };
        if let Some(dir) = artifacts_dir {
            builder.set_artifacts_dir(dir);
        }

        Ok(Self {
            output,
            cwd,
            comparator: builder.build(cache, runner),
            hide_details: run_opts.hide_details,
        })
    }

    fn exec_compare(
        &self,
        project_urls: &[String],
        inject_new: &str,
        inject_base: &str,
        message_format: MessageFormat,
        junit: Option<&Utf8Path>,
        record_to: Option<&Utf8Path>,
    ) -> Result<i32> {
        let batch = build_runtime()?.block_on(async {
            let mut shutdown = ShutdownHandlerKind::Standard.build()?;
            let batch = self
                .comparator
                .compare(project_urls, inject_new, inject_base, &self.cwd, &mut shutdown)
                .await?;
            Ok::<_, ExpectedError>(batch)
        })?;

        let stdout = std::io::stdout();
        let mut writer = BufWriter::new(stdout.lock());
        match message_format {
            MessageFormat::Human => self
                .reporter()
                .write_comparison(&batch, &mut writer)
                .map_err(ExpectedError::write_output)?,
            MessageFormat::Json => serde_json::to_writer(&mut writer, &batch.to_summary())
                .map_err(|err| ExpectedError::SerializeOutput { err })?,
            MessageFormat::JsonPretty => {
                serde_json::to_writer_pretty(&mut writer, &batch.to_summary())
                    .map_err(|err| ExpectedError::SerializeOutput { err })?;
            }
        }
        if message_format != MessageFormat::Human {
            writeln!(writer).map_err(ExpectedError::write_output)?;
        }
        writer.flush().map_err(ExpectedError::write_output)?;

        if let Some(path) = junit {
            let path = self.cwd.join(path);
            write_junit(&batch, &path)?;
            info!("wrote JUnit report to {path}");
        }
        if let Some(path) = record_to {
            let runs = batch
                .projects
                .iter()
                .filter_map(|project| project.outcome.as_ref().ok())
                .flat_map(|compared| [&compared.base_run, &compared.new_run]);
            self.write_records(path, runs)?;
        }

        Ok(comparison_exit_code(&batch))
    }

    fn exec_run(
        &self,
        project_urls: &[String],
        inject: &str,
        record_to: Option<&Utf8Path>,
    ) -> Result<i32> {
        let batch = build_runtime()?.block_on(async {
            let mut shutdown = ShutdownHandlerKind::Standard.build()?;
            let batch = self
                .comparator
                .run_many(project_urls, inject, &self.cwd, &mut shutdown)
                .await?;
            Ok::<_, ExpectedError>(batch)
        })?;

        let stdout = std::io::stdout();
        let mut writer = BufWriter::new(stdout.lock());
        self.reporter()
            .write_run(&batch, &mut writer)
            .map_err(ExpectedError::write_output)?;
        writer.flush().map_err(ExpectedError::write_output)?;

        if let Some(path) = record_to {
            let runs = batch
                .projects
                .iter()
                .filter_map(|project| project.outcome.as_ref().ok());
            self.write_records(path, runs)?;
        }

        Ok(run_exit_code(&batch))
    }

    fn reporter(&self) -> Reporter {
        let mut reporter = ReporterBuilder::default()
            .set_hide_details(self.hide_details)
            .build();
        if self.output.should_colorize_stdout() {
            reporter.colorize();
        }
        reporter
    }

    fn write_records<'a>(
        &self,
        path: &Utf8Path,
        runs: impl IntoIterator<Item = &'a ProjectRunResult>,
    ) -> Result<()> {
        let path = self.cwd.join(path);
        let mut sink = JsonLinesSink::create(&path)?;
        let mut flattener = RecordFlattener::new();
        let mut written = 0;
        for run in runs {
            written += write_project_run(&mut flattener, run, &mut sink)?;
        }
        sink.finish()?;
        info!("wrote {written} records to {path}");
        Ok(())
    }
}

fn exec_dependents(package: &str, api_key: &str, limit: usize) -> Result<i32> {
    let urls = DependentsClient::new()
        .fetch(package, api_key, limit)
        .map_err(|err| ExpectedError::DiscoveryError {
            package: package.to_owned(),
            err,
        })?;

    let stdout = std::io::stdout();
    let mut writer = BufWriter::new(stdout.lock());
    for url in &urls {
        writeln!(writer, "{url}").map_err(ExpectedError::write_output)?;
    }
    writer.flush().map_err(ExpectedError::write_output)?;
    Ok(CheckonExitCode::OK)
}

fn current_dir() -> Result<Utf8PathBuf> {
    let cwd = std::env::current_dir().map_err(|err| ExpectedError::CurrentDirInvalid { err })?;
    Utf8PathBuf::from_path_buf(cwd).map_err(|path| ExpectedError::CurrentDirNotUtf8 { path })
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| ExpectedError::TokioRuntimeCreate { err })
}

fn comparison_exit_code(batch: &BatchComparison) -> i32 {
    if batch.cancelled {
        CheckonExitCode::CANCELLED
    } else if batch.has_differences() {
        CheckonExitCode::DIFFERENCES_FOUND
    } else if batch.failed_count() > 0 {
        CheckonExitCode::PROJECT_FAILED
    } else {
        CheckonExitCode::OK
    }
}

fn run_exit_code(batch: &BatchRun) -> i32 {
    if batch.cancelled {
        CheckonExitCode::CANCELLED
    } else if batch
        .projects
        .iter()
        .any(|project| project.outcome.is_err())
    {
        CheckonExitCode::PROJECT_FAILED
    } else {
        CheckonExitCode::OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn verify_app() {
        CheckonApp::command().debug_assert();
    }

    #[test_case(&["checkon", "compare", "--inject-new", "widget==2.0", "--inject-base", "widget==1.0", "https://example.com/a"] ; "compare")]
    #[test_case(&["checkon", "compare", "--inject-new", "./widget", "--inject-base", "widget", "-e", "py37,py38", "-j", "4", "--env-jobs", "2", "--exclude-unhealthy", "https://example.com/a", "https://example.com/b"] ; "compare with run options")]
    #[test_case(&["checkon", "--color", "never", "-v", "compare", "--inject-new", "a", "--inject-base", "b", "--message-format", "json-pretty", "--junit", "out.xml", "--record-to", "records.jsonl", "--hide-details", "u"] ; "compare with output options")]
    #[test_case(&["checkon", "compare", "--inject-new", "a", "--inject-base", "b", "--dependents-of", "widget", "--api-key", "key"] ; "compare dependents")]
    #[test_case(&["checkon", "run", "--inject", "widget==2.0", "--artifacts-dir", "artifacts", "https://example.com/a"] ; "run")]
    #[test_case(&["checkon", "dependents", "widget", "--api-key", "key", "--limit", "10"] ; "dependents")]
    #[test_case(&["checkon", "--config-file", "ci.toml", "run", "--inject", "a", "u"] ; "config file")]
    fn valid_args(args: &[&str]) {
        if let Err(err) = CheckonApp::try_parse_from(args) {
            panic!("{args:?} should parse, but failed with:\n{err}");
        }
    }

    #[test_case(&["checkon", "compare", "--inject-new", "a", "u"] ; "missing base")]
    #[test_case(&["checkon", "run", "u"] ; "missing inject")]
    #[test_case(&["checkon", "run", "--inject", "a", "-j", "0", "u"] ; "zero jobs")]
    #[test_case(&["checkon", "compare", "--inject-new", "a", "--inject-base", "b", "--message-format", "xml", "u"] ; "unknown format")]
    #[test_case(&["checkon", "run", "--inject", "a", "--junit", "out.xml", "u"] ; "junit is compare only")]
    fn invalid_args(args: &[&str]) {
        CheckonApp::try_parse_from(args).unwrap_err();
    }

    #[test]
    fn env_fragments_are_comma_separated() {
        let app = CheckonApp::try_parse_from([
            "checkon", "run", "--inject", "a", "-e", "py37,py38", "--env", "lint", "u",
        ])
        .unwrap();
        match app.command {
            Command::Run { run_opts, .. } => {
                assert_eq!(run_opts.envs, ["py37", "py38", "lint"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn hide_details_defaults_off() {
        let parse = |args: &[&str]| match CheckonApp::try_parse_from(args).unwrap().command {
            Command::Run { run_opts, .. } => run_opts.hide_details,
            other => panic!("unexpected command: {other:?}"),
        };
        assert!(!parse(&["checkon", "run", "--inject", "a", "u"]));
        assert!(parse(&["checkon", "run", "--inject", "a", "--hide-details", "u"]));
    }

    #[test]
    fn no_projects_is_an_error() {
        let opts = ProjectOpts {
            urls: Vec::new(),
            dependents_of: None,
            api_key: None,
            dependents_limit: DEFAULT_LIMIT,
        };
        let err = opts.resolve().unwrap_err();
        assert!(matches!(err, ExpectedError::NoProjects));
        assert_eq!(err.process_exit_code(), CheckonExitCode::SETUP_ERROR);
    }
}

// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use checkon_metadata::CheckonExitCode;
use checkon_runner::errors::*;
use owo_colors::OwoColorize;
use std::error::Error;
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// The #[error()] strings are placeholders: errors are meant to be printed with display_to_stderr,
// which colorizes them and prints their causes.

/// An error checkon expects to encounter, as opposed to a bug.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("current directory is invalid")]
    CurrentDirInvalid {
        #[source]
        err: std::io::Error,
    },
    #[error("current directory is not valid UTF-8")]
    CurrentDirNotUtf8 { path: std::path::PathBuf },
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("cache directory error")]
    CacheDirError {
        #[from]
        err: CacheDirError,
    },
    #[error("cache open error")]
    CacheOpenError {
        #[source]
        err: CacheError,
    },
    #[error("environment filter error")]
    EnvironmentFilterError {
        #[from]
        err: EnvironmentFilterError,
    },
    #[error("no projects specified")]
    NoProjects,
    #[error("failed to create tokio runtime")]
    TokioRuntimeCreate {
        #[source]
        err: std::io::Error,
    },
    #[error("shutdown handler setup error")]
    ShutdownHandlerSetupError {
        #[from]
        err: ShutdownHandlerSetupError,
    },
    #[error("requirement resolve error")]
    RequirementResolveError {
        #[from]
        err: RequirementResolveError,
    },
    #[error("discovery error")]
    DiscoveryError {
        package: String,
        #[source]
        err: DiscoveryError,
    },
    #[error("write report error")]
    WriteReportError {
        #[from]
        err: WriteReportError,
    },
    #[error("record sink error")]
    RecordSinkError {
        #[from]
        err: RecordSinkError,
    },
    #[error("failed to write output")]
    WriteOutput {
        #[source]
        err: std::io::Error,
    },
    #[error("failed to serialize output")]
    SerializeOutput {
        #[source]
        err: serde_json::Error,
    },
}

impl ExpectedError {
    pub(crate) fn write_output(err: std::io::Error) -> Self {
        Self::WriteOutput { err }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::CurrentDirInvalid { .. }
            | Self::CurrentDirNotUtf8 { .. }
            | Self::ConfigParseError { .. }
            | Self::CacheDirError { .. }
            | Self::CacheOpenError { .. }
            | Self::EnvironmentFilterError { .. }
            | Self::NoProjects
            | Self::TokioRuntimeCreate { .. }
            | Self::ShutdownHandlerSetupError { .. } => CheckonExitCode::SETUP_ERROR,
            Self::RequirementResolveError { .. } => CheckonExitCode::REQUIREMENT_RESOLVE_FAILED,
            Self::DiscoveryError { .. } => CheckonExitCode::DISCOVERY_FAILED,
            Self::WriteReportError { .. }
            | Self::RecordSinkError { .. }
            | Self::WriteOutput { .. }
            | Self::SerializeOutput { .. } => CheckonExitCode::WRITE_OUTPUT_ERROR,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match self {
            Self::CurrentDirInvalid { err } => {
                error!("could not read the current directory");
                Some(err as &dyn Error)
            }
            Self::CurrentDirNotUtf8 { path } => {
                error!(
                    "current directory `{}` is not valid UTF-8",
                    path.display().style(styles.bold)
                );
                None
            }
            Self::ConfigParseError { err } => {
                error!("{err}");
                err.source()
            }
            Self::CacheDirError { err } => {
                error!("{err}");
                err.source()
            }
            Self::CacheOpenError { err } => {
                error!("failed to open the checkout cache");
                Some(err as &dyn Error)
            }
            Self::EnvironmentFilterError { err } => {
                error!("{err}");
                err.source()
            }
            Self::NoProjects => {
                error!(
                    "no projects specified: pass repository URLs or {}",
                    "--dependents-of".style(styles.bold)
                );
                None
            }
            Self::TokioRuntimeCreate { err } => {
                error!("failed to create the async runtime");
                Some(err as &dyn Error)
            }
            Self::ShutdownHandlerSetupError { err } => {
                error!("{err}");
                err.source()
            }
            Self::RequirementResolveError { err } => {
                error!("{err}");
                err.source()
            }
            Self::DiscoveryError { package, err } => {
                error!(
                    "failed to discover dependents of `{}`",
                    package.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
            Self::WriteReportError { err } => {
                error!("{err}");
                err.source()
            }
            Self::RecordSinkError { err } => {
                error!("{err}");
                err.source()
            }
            Self::WriteOutput { err } => {
                error!("failed to write to stdout");
                Some(err as &dyn Error)
            }
            Self::SerializeOutput { err } => {
                error!("failed to serialize the summary");
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            error!(
                target: NO_HEADING_TARGET,
                "\n{}\n  {err}",
                "Caused by:".style(styles.warning_text)
            );
            next_error = err.source();
        }
    }
}

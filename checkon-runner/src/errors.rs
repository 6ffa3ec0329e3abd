// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by checkon.

use crate::{
    helpers::{DisplayExitCode, DisplayStderr},
    results::EnvironmentName,
};
use camino::Utf8PathBuf;
use config::ConfigError;
use std::{fmt, io, path::PathBuf};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse checkon config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing a config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),

    /// A value was well-typed but not acceptable.
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue {
        /// The dotted key.
        key: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// An error that occurred while determining the cache directory.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheDirError {
    /// The platform base directories could not be determined.
    #[error("could not determine the platform cache directory")]
    BaseDirStrategy,

    /// The platform cache directory is not valid UTF-8.
    #[error("platform cache directory is not valid UTF-8: {}", .path.display())]
    CacheDirNotUtf8 {
        /// The path that was not UTF-8.
        path: PathBuf,
    },
}

/// A revision identifier that is not a full hexadecimal commit hash.
#[derive(Clone, Debug, Error)]
#[error("`{input}` is not a full commit hash (expected 40 or 64 hex digits)")]
pub struct InvalidRevision {
    input: String,
}

impl InvalidRevision {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error that occurred while preparing a revision-keyed checkout.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    /// A cache directory could not be created.
    #[error("failed to create cache directory `{path}`")]
    CreateDir {
        /// The directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: io::Error,
    },

    /// The version control program could not be started.
    #[error("failed to run `{program}`")]
    GitSpawn {
        /// The program.
        program: String,
        /// The underlying error.
        #[source]
        err: io::Error,
    },

    /// Cloning failed.
    #[error("cloning `{url}` failed with {}{}", DisplayExitCode(*.exit_code), DisplayStderr(.stderr))]
    CloneFailed {
        /// The repository URL.
        url: String,
        /// The exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// Reading the checked-out revision failed.
    #[error(
        "reading the revision of `{url}` failed with {}{}",
        DisplayExitCode(*.exit_code),
        DisplayStderr(.stderr)
    )]
    RevParseFailed {
        /// The repository URL.
        url: String,
        /// The exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The revision that was read is not usable as a cache key.
    #[error("unexpected revision for `{url}`")]
    InvalidRevision {
        /// The repository URL.
        url: String,
        /// The underlying error.
        #[source]
        err: InvalidRevision,
    },

    /// A temporary clone directory could not be created.
    #[error("failed to create a temporary clone directory under `{path}`")]
    TempDir {
        /// The parent directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: io::Error,
    },

    /// The per-revision lock could not be taken.
    #[error("failed to lock `{path}`")]
    Lock {
        /// The lock file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: io::Error,
    },

    /// A fresh clone could not be moved into place.
    #[error("failed to move fresh clone `{from}` to `{to}`")]
    PlaceCheckout {
        /// The fresh clone.
        from: Utf8PathBuf,
        /// The canonical checkout path.
        to: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: io::Error,
    },

    /// The setup-complete marker could not be read.
    #[error("failed to read setup marker `{path}`")]
    SetupMarkerRead {
        /// The marker file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: io::Error,
    },

    /// The setup-complete marker could not be written.
    #[error("failed to write setup marker `{path}`")]
    SetupMarkerWrite {
        /// The marker file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: atomicwrites::Error<io::Error>,
    },
}

/// An error that occurred while resolving an injected requirement.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RequirementResolveError {
    /// The requirement was empty.
    #[error("requirement is empty")]
    Empty,

    /// The requirement was interpreted as a local path, but the path could not be resolved.
    #[error("requirement `{input}` looks like a local path, but `{path}` could not be resolved")]
    PathNotFound {
        /// The requirement as given.
        input: String,
        /// The path that was looked up.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: io::Error,
    },
}

/// An error that occurred while building an environment filter.
#[derive(Debug, Error)]
#[error("invalid environment filter `{fragment}`")]
pub struct EnvironmentFilterError {
    fragment: String,
    #[source]
    err: globset::Error,
}

impl EnvironmentFilterError {
    pub(crate) fn new(fragment: impl Into<String>, err: globset::Error) -> Self {
        Self {
            fragment: fragment.into(),
            err,
        }
    }
}

/// An environment name that cannot be used.
#[derive(Clone, Debug, Error)]
#[error("invalid environment name `{name}`: {reason}")]
pub struct InvalidEnvironmentName {
    name: String,
    reason: &'static str,
}

impl InvalidEnvironmentName {
    pub(crate) fn new(name: impl Into<String>, reason: &'static str) -> Self {
        Self {
            name: name.into(),
            reason,
        }
    }
}

/// An error that occurred while parsing environment run artifacts.
#[derive(Debug, Error)]
#[error("failed to parse `{path}`")]
pub struct ParseError {
    path: Utf8PathBuf,
    #[source]
    kind: ParseErrorKind,
}

impl ParseError {
    pub(crate) fn new(path: impl Into<Utf8PathBuf>, kind: ParseErrorKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// The file being parsed.
    pub fn path(&self) -> &camino::Utf8Path {
        &self.path
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing environment run artifacts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseErrorKind {
    /// The file could not be read.
    #[error("failed to read file")]
    Read(#[source] io::Error),

    /// The XML was not well-formed.
    #[error("malformed XML at byte {position}")]
    Xml {
        /// The byte offset.
        position: u64,
        /// The underlying error.
        #[source]
        err: quick_xml::Error,
    },

    /// Element text was not valid UTF-8.
    #[error("invalid UTF-8 text at byte {position}")]
    InvalidText {
        /// The byte offset.
        position: u64,
        /// The underlying error.
        #[source]
        err: std::str::Utf8Error,
    },

    /// Start and end elements did not balance.
    #[error("unbalanced element at byte {position}")]
    Unbalanced {
        /// The byte offset.
        position: u64,
    },

    /// The document ended with elements still open.
    #[error("document ended unexpectedly")]
    UnexpectedEof,

    /// The document had no root element.
    #[error("document has no root element")]
    MissingRoot,

    /// The document had more than one root element.
    #[error("document has more than one root element")]
    MultipleRoots,

    /// The root element was not `<testsuites>`.
    #[error("expected a <testsuites> root element, found <{found}>")]
    UnexpectedRoot {
        /// The root element name.
        found: String,
    },

    /// The report did not contain exactly one suite.
    #[error("expected exactly one <testsuite>, found {found}")]
    SuiteCount {
        /// The number of suites found.
        found: usize,
    },

    /// A required attribute was missing.
    #[error("<{element}> is missing required attribute `{attribute}`")]
    MissingAttribute {
        /// The element name.
        element: &'static str,
        /// The attribute name.
        attribute: &'static str,
    },

    /// An attribute value had the wrong type.
    #[error("<{element}> attribute `{attribute}` has invalid value `{value}`: {reason}")]
    InvalidAttribute {
        /// The element name.
        element: &'static str,
        /// The attribute name.
        attribute: &'static str,
        /// The value as written.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A test case had more than one failure or error block.
    #[error("test case `{test_case}` has {count} failure blocks, expected at most one")]
    MultipleFailureBlocks {
        /// The test case name.
        test_case: String,
        /// The number of blocks.
        count: usize,
    },

    /// The result JSON did not match the expected shape.
    #[error("invalid result JSON at `{}`", .0.path())]
    Json(#[source] serde_path_to_error::Error<serde_json::Error>),

    /// The file was not inside an environment directory.
    #[error("file is not inside an environment directory")]
    NoEnvironmentDir,

    /// The environment directory name was not a valid environment name.
    #[error(transparent)]
    InvalidEnvironment(InvalidEnvironmentName),

    /// The report and the result JSON came from different environment directories.
    #[error("report is for environment `{report}` but result JSON is for `{metadata}`")]
    MismatchedEnvironment {
        /// The environment of the report.
        report: EnvironmentName,
        /// The environment of the result JSON.
        metadata: EnvironmentName,
    },
}

/// An error that occurred while listing a project's environments.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ListEnvironmentsError {
    /// The tool could not be started.
    #[error("failed to run `{command}`")]
    Spawn {
        /// The command line.
        command: String,
        /// The underlying error.
        #[source]
        err: io::Error,
    },

    /// The tool exited unsuccessfully.
    #[error("`{command}` failed with {}{}", DisplayExitCode(*.exit_code), DisplayStderr(.stderr))]
    Failed {
        /// The command line.
        command: String,
        /// The exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The tool listed an environment that cannot be used.
    #[error("`{command}` listed an unusable environment")]
    InvalidName {
        /// The command line.
        command: String,
        /// The underlying error.
        #[source]
        err: InvalidEnvironmentName,
    },
}

/// An error that stopped one project from being run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProjectRunError {
    /// The checkout could not be prepared.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The project's environments could not be listed.
    #[error(transparent)]
    ListEnvironments(#[from] ListEnvironmentsError),

    /// The output directory for a run could not be created.
    #[error("failed to create output directory `{path}`")]
    OutputRoot {
        /// The directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: io::Error,
    },
}

/// An error that occurred while writing a report file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WriteReportError {
    /// Writing the file failed.
    #[error("failed to write `{path}`")]
    Io {
        /// The file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: io::Error,
    },

    /// Serializing a JUnit report failed.
    #[error("failed to serialize JUnit report to `{path}`")]
    Junit {
        /// The file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: quick_junit::SerializeError,
    },
}

/// An error that occurred while writing result records.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecordSinkError {
    /// The sink could not be opened.
    #[error("failed to open record sink `{path}`")]
    Open {
        /// The file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: io::Error,
    },

    /// A record could not be written.
    #[error("failed to write to record sink `{path}`")]
    Write {
        /// The file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: io::Error,
    },

    /// A record could not be serialized.
    #[error("failed to serialize record")]
    Serialize(#[source] serde_json::Error),
}

/// An error that occurred while discovering dependent projects.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// The package name cannot be used in a request.
    #[error("invalid package name `{name}`")]
    InvalidPackageName {
        /// The name as given.
        name: String,
    },

    /// The request failed.
    #[error("request to `{url}` failed")]
    Request {
        /// The URL, without query parameters.
        url: String,
        /// The underlying error.
        #[source]
        err: Box<ureq::Error>,
    },

    /// The response could not be parsed.
    #[error("unexpected response from `{url}`")]
    Parse {
        /// The URL, without query parameters.
        url: String,
        /// The underlying error.
        #[source]
        err: serde_json::Error,
    },
}

/// An error occurred while setting up the shutdown handler.
#[derive(Debug, Error)]
#[error("error setting up shutdown handler")]
pub struct ShutdownHandlerSetupError(#[source] io::Error);

impl ShutdownHandlerSetupError {
    pub(crate) fn new(err: io::Error) -> Self {
        Self(err)
    }
}

/// Displays an error followed by its chain of sources on one line, separated by `: `.
pub struct DisplayErrorChain<E> {
    error: E,
}

impl<E: std::error::Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E: std::error::Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        let mut source = self.error.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

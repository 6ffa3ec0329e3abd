// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `checkon` failures.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum CheckonExitCode {}

impl CheckonExitCode {
    /// No errors occurred, and no project showed a difference in failures.
    pub const OK: i32 = 0;

    /// At least one project's failure set differed between the two injected requirements.
    pub const DIFFERENCES_FOUND: i32 = 100;

    /// At least one project could not be run (clone failure, unreadable revision, or the
    /// environment list could not be obtained), and no other project showed differences.
    pub const PROJECT_FAILED: i32 = 101;

    /// A user issue happened while setting up a checkon invocation, e.g. a bad config file.
    pub const SETUP_ERROR: i32 = 96;

    /// An injected requirement could not be resolved.
    pub const REQUIREMENT_RESOLVE_FAILED: i32 = 97;

    /// Querying the dependents directory service failed.
    pub const DISCOVERY_FAILED: i32 = 98;

    /// Writing data to stdout, stderr or an output file produced an error.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;

    /// The run was interrupted by a signal before every project finished.
    pub const CANCELLED: i32 = 130;
}

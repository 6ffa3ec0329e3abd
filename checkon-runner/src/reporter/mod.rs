// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Report comparison results in human and machine-readable formats.
//!
//! The human-readable output is written by [`Reporter`], constructed via a [`ReporterBuilder`].
//! JUnit output goes through [`write_junit`], and JSON output is the
//! [`ComparisonSummary`](checkon_metadata::ComparisonSummary) returned by
//! [`BatchComparison::to_summary`](crate::compare::BatchComparison::to_summary).

mod human;
mod junit;

pub use human::*;
pub use junit::write_junit;

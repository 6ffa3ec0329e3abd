// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for checkon, which runs the test suites of downstream projects against two
//! versions of a dependency and reports the failures the new version introduces.
//!
//! The flow is: [`cache`] checks each project out at its current revision,
//! [`env_runner`] runs every selected tox environment with the injected requirement,
//! [`results`] parses what each environment wrote, and [`compare`] diffs the base and new runs
//! into a [`RegressionReport`](compare::RegressionReport).

pub mod cache;
pub mod compare;
pub mod config;
pub mod discovery;
pub mod env_filter;
pub mod env_runner;
pub mod errors;
mod helpers;
pub mod reporter;
pub mod requirement;
pub mod results;
pub mod signal;
pub mod sink;
mod tool;

// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run the test suites of downstream projects against two versions of a dependency, and report
//! the tests the new version breaks.
//!
//! This crate is the command-line interface. The logic lives in `checkon-runner`, and the
//! machine-readable output formats in `checkon-metadata`.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::{Color, OutputContext, StderrStyles};

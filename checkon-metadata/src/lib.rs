// Copyright (c) The checkon Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Machine-readable output for [checkon](https://github.com/checkon-rs/checkon).
//!
//! `checkon compare --message-format json` prints a [`ComparisonSummary`]. The
//! process exit codes are documented in [`CheckonExitCode`].

mod exit_codes;
mod summary;

pub use exit_codes::*;
pub use summary::*;

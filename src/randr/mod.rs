// SPDX-License-Identifier: GPL-3.0-only
//! Access to the display configuration tool
//!
//! The reconciler only talks to the display subsystem through
//! [`RandrBackend`]: one call to dump every output with its modes, one call to
//! apply a mode. [`XrandrCommand`] implements it by spawning `xrandr`; tests
//! substitute an in-memory backend.

pub mod parse;
pub mod xrandr;

use std::future::Future;

pub use xrandr::XrandrCommand;

use crate::error::Result;
use crate::mode::ApplyRequest;

/// Query and apply capabilities of the display subsystem
pub trait RandrBackend: Send + Sync + 'static {
    /// Full text dump of all outputs and their mode lines
    fn query(&self) -> impl Future<Output = Result<String>> + Send;

    /// Apply `request` to the output called `output`
    fn apply(&self, output: &str, request: &ApplyRequest) -> impl Future<Output = Result<()>> + Send;
}

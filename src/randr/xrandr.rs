// SPDX-License-Identifier: GPL-3.0-only
//! `xrandr` subprocess backend
//!
//! Every invocation is bounded by the configured timeout. The child is
//! spawned with `kill_on_drop`, so dropping the timed-out future kills it
//! instead of leaving a stuck tool behind.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::RandrBackend;
use crate::error::{ReconcileError, Result};
use crate::mode::ApplyRequest;

#[derive(Debug, Clone)]
pub struct XrandrCommand {
    program: String,
    /// Arguments placed before every query/apply argument list,
    /// e.g. `--display :0`
    base_args: Vec<String>,
    timeout: Duration,
}

impl XrandrCommand {
    /// Build from a whitespace-separated command line such as
    /// `xrandr --display :0`. Returns `None` for a blank line.
    pub fn from_command_line(line: &str, timeout: Duration) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            base_args: parts.collect(),
            timeout,
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> ReconcileError {
        ReconcileError::Spawn {
            tool: self.program.clone(),
            source,
        }
    }
}

impl RandrBackend for XrandrCommand {
    async fn query(&self) -> Result<String> {
        let child = self
            .command()
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| self.spawn_error(e))?,
            Err(_) => {
                warn!("{} query timed out after {:?}, killed", self.program, self.timeout);
                return Err(ReconcileError::QueryTimeout(self.timeout));
            }
        };

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        if text.trim().is_empty() {
            return Err(ReconcileError::QueryEmpty);
        }
        Ok(text)
    }

    async fn apply(&self, output: &str, request: &ApplyRequest) -> Result<()> {
        let args = apply_args(output, request);
        info!("{} args = {:?}", self.program, args);

        let mut cmd = self.command();
        cmd.args(&args).stdout(Stdio::null()).stderr(Stdio::null());
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(result) => result.map_err(|e| self.spawn_error(e))?,
            Err(_) => {
                // kill_on_drop only fires when `child` is dropped; do it now
                let _ = child.kill().await;
                error!(
                    "{} set mode timed out, output = {}, args = {:?}",
                    self.program, output, args
                );
                return Err(ReconcileError::ApplyTimeout(self.timeout));
            }
        };

        if !status.success() {
            error!(
                "{} set mode failed, code = {:?}, output = {}, args = {:?}",
                self.program,
                status.code(),
                output,
                args
            );
            return Err(ReconcileError::ApplyFailed {
                code: status.code(),
            });
        }

        Ok(())
    }
}

/// Arguments for the apply tool
///
/// The rate is passed only for a preferred (tier 1) selection, with two
/// decimal places.
pub fn apply_args(output: &str, request: &ApplyRequest) -> Vec<String> {
    let mut args = vec!["--output".to_string(), output.to_string()];

    match request {
        ApplyRequest::Mode { mode, with_rate } => {
            args.push("--mode".to_string());
            args.push(mode.name());
            if *with_rate {
                args.push("--rate".to_string());
                args.push(format!("{:.2}", mode.rate));
            }
        }
        ApplyRequest::Auto => args.push("--auto".to_string()),
    }

    args
}

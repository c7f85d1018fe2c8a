// SPDX-License-Identifier: GPL-3.0-only
//! Value types shared by the parser, selector and applier

use std::fmt;

/// One advertised width/height/refresh-rate combination of an output
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mode {
    pub width: u32,
    pub height: u32,
    /// Refresh rate in Hz
    pub rate: f64,
}

impl Mode {
    pub fn new(width: u32, height: u32, rate: f64) -> Self {
        Self { width, height, rate }
    }

    /// Mode string as understood by the apply tool (e.g. "1920x1080")
    pub fn name(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// Whether this mode has exactly the given dimensions
    pub fn has_size(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.rate)
    }
}

/// Parsed state of one output at one query instant
///
/// Rebuilt on every pass and dropped afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSnapshot {
    pub name: String,
    pub connected: bool,
    pub modes: Vec<Mode>,
}

/// Outcome of mode selection, carrying the tier that produced it
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SelectionResult {
    /// Tier 1: exact target resolution within the rate cap
    Preferred(Mode),
    /// Tier 2: best-effort fallback
    Fallback(Mode),
    NoCandidate,
}

/// What the apply tool is asked to do for one output
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ApplyRequest {
    /// Set an explicit mode, passing the rate only when `with_rate` is set
    Mode { mode: Mode, with_rate: bool },
    /// Let the display subsystem pick its automatic configuration
    Auto,
}

impl From<SelectionResult> for ApplyRequest {
    fn from(selection: SelectionResult) -> Self {
        match selection {
            SelectionResult::Preferred(mode) => Self::Mode {
                mode,
                with_rate: true,
            },
            SelectionResult::Fallback(mode) => Self::Mode {
                mode,
                with_rate: false,
            },
            SelectionResult::NoCandidate => Self::Auto,
        }
    }
}

impl fmt::Display for ApplyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mode {
                mode,
                with_rate: true,
            } => write!(f, "{} @ {:.2}", mode.name(), mode.rate),
            Self::Mode { mode, .. } => write!(f, "{}", mode.name()),
            Self::Auto => write!(f, "auto"),
        }
    }
}

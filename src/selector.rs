// SPDX-License-Identifier: GPL-3.0-only
//! Tiered mode selection
//!
//! Tier 1 looks for the exact target resolution within the rate cap and takes
//! its fastest rate. Tier 2 ignores every mode of exactly the target
//! resolution, prefers modes that fit inside the target, and otherwise takes
//! the best of what is left. Within a tier the tallest, then widest, then
//! fastest mode wins.

use std::cmp::Ordering;

use crate::config::Policy;
use crate::mode::{Mode, SelectionResult};

#[derive(Debug, Clone, Copy)]
pub struct ModeSelector {
    policy: Policy,
}

impl ModeSelector {
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Pick a mode for one output. Pure and order-independent.
    pub fn select(&self, modes: &[Mode]) -> SelectionResult {
        let Policy {
            cap_width,
            cap_height,
            cap_rate_hz,
        } = self.policy;

        let preferred = modes
            .iter()
            .filter(|m| m.has_size(cap_width, cap_height) && m.rate <= cap_rate_hz)
            .max_by(|a, b| compare(a, b));
        if let Some(mode) = preferred {
            return SelectionResult::Preferred(*mode);
        }

        // Over-rate modes of exactly the target size are not candidates in
        // either fallback group.
        let (fits, exceeds): (Vec<&Mode>, Vec<&Mode>) = modes
            .iter()
            .filter(|m| !m.has_size(cap_width, cap_height))
            .partition(|m| m.width <= cap_width && m.height <= cap_height);

        let group = if fits.is_empty() { exceeds } else { fits };
        group
            .into_iter()
            .max_by(|a, b| compare(a, b))
            .map_or(SelectionResult::NoCandidate, |mode| {
                SelectionResult::Fallback(*mode)
            })
    }
}

/// Height first, then width, then refresh rate
fn compare(a: &Mode, b: &Mode) -> Ordering {
    a.height
        .cmp(&b.height)
        .then(a.width.cmp(&b.width))
        .then(a.rate.total_cmp(&b.rate))
}

// SPDX-License-Identifier: GPL-3.0-only
//! Query → parse → select → apply, one output at a time
//!
//! A failure on the query/parse/select side of an output falls back to the
//! automatic configuration. A failed apply is only logged; the next poll tick
//! or hotplug event starts over from a fresh query.

use crate::error::ReconcileError;
use crate::mode::{ApplyRequest, SelectionResult};
use crate::randr::{RandrBackend, parse};
use crate::selector::ModeSelector;

/// What happened to one output during a pass
#[derive(Debug)]
pub struct OutputOutcome {
    pub output: String,
    /// Request sent to the apply tool
    pub request: ApplyRequest,
    /// Why the automatic configuration was used instead of a selected mode
    pub fallback_reason: Option<ReconcileError>,
    /// Result of the apply call
    pub applied: Result<(), ReconcileError>,
}

impl OutputOutcome {
    pub fn is_success(&self) -> bool {
        self.applied.is_ok()
    }
}

#[derive(Debug, Default)]
pub struct PassReport {
    pub outcomes: Vec<OutputOutcome>,
}

impl PassReport {
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_success()).count()
    }
}

pub struct Reconciler<B> {
    backend: B,
    selector: ModeSelector,
}

impl<B: RandrBackend> Reconciler<B> {
    pub fn new(backend: B, selector: ModeSelector) -> Self {
        Self { backend, selector }
    }

    #[cfg(test)]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Names of all currently connected outputs, from a fresh query
    pub async fn connected_outputs(&self) -> Result<Vec<String>, ReconcileError> {
        let text = self.backend.query().await?;
        Ok(parse::connected_outputs(&text))
    }

    /// Reconcile every output in `outputs`, strictly in sequence
    pub async fn reconcile<I, S>(&self, outputs: I) -> PassReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = PassReport::default();
        for output in outputs {
            report.outcomes.push(self.reconcile_output(output.as_ref()).await);
        }

        let fallbacks = report
            .outcomes
            .iter()
            .filter(|o| o.fallback_reason.is_some())
            .count();
        if report.failed() > 0 {
            let failed: Vec<String> = report
                .outcomes
                .iter()
                .filter(|o| !o.is_success())
                .map(|o| format!("{} ({})", o.output, o.request))
                .collect();
            warn!(
                "Reconciliation pass finished, {}/{} output(s) failed: {:?}",
                failed.len(),
                report.outcomes.len(),
                failed
            );
        } else {
            debug!(
                "Reconciliation pass finished for {} output(s), {} on automatic configuration",
                report.outcomes.len(),
                fallbacks
            );
        }
        report
    }

    /// Reconcile a single output; never fails
    pub async fn reconcile_output(&self, output: &str) -> OutputOutcome {
        info!("Apply policy for output: {}", output);

        let (request, fallback_reason) = match self.plan(output).await {
            Ok(selection) => (ApplyRequest::from(selection), None),
            Err(err) => {
                warn!("{}: {}, falling back to automatic configuration", output, err);
                (ApplyRequest::Auto, Some(err))
            }
        };

        let applied = self.backend.apply(output, &request).await;
        match &applied {
            Ok(()) => info!("Applied {} to {}", request, output),
            Err(err) => error!("Failed to apply {} to {}: {}", request, output, err),
        }

        OutputOutcome {
            output: output.to_string(),
            request,
            fallback_reason,
            applied,
        }
    }

    /// Query, parse and select; `Err` means "use the automatic configuration"
    async fn plan(&self, output: &str) -> Result<SelectionResult, ReconcileError> {
        let text = self.backend.query().await?;

        let snapshot = parse::find_output(&text, output)
            .ok_or_else(|| ReconcileError::HeaderNotFound(output.to_string()))?;
        debug!(
            "{}: {} mode(s) parsed, connected = {}",
            snapshot.name,
            snapshot.modes.len(),
            snapshot.connected
        );
        if snapshot.modes.is_empty() {
            return Err(ReconcileError::NoModesParsed(output.to_string()));
        }

        match self.selector.select(&snapshot.modes) {
            SelectionResult::NoCandidate => Err(ReconcileError::SelectorNoCandidate),
            selection @ SelectionResult::Preferred(mode) => {
                info!(
                    "Found {} <= {}Hz mode for {}: {}",
                    mode.name(),
                    self.selector.policy().cap_rate_hz,
                    output,
                    mode
                );
                Ok(selection)
            }
            selection @ SelectionResult::Fallback(mode) => {
                info!("Fallback mode for {}: {}", output, mode);
                Ok(selection)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::config::Policy;
    use crate::error::Result;
    use crate::mode::Mode;
    use crate::randr::xrandr::apply_args;

    /// Canned query response of the mock backend
    pub enum QueryReply {
        Text(String),
        Timeout,
        Empty,
    }

    /// In-memory backend recording every apply call as its tool arguments
    pub struct MockBackend {
        pub reply: Mutex<QueryReply>,
        pub applied: Mutex<Vec<Vec<String>>>,
        /// Outputs whose apply call exits with code 1
        pub failing: Vec<String>,
    }

    impl MockBackend {
        pub fn with_text(text: &str) -> Self {
            Self::with_reply(QueryReply::Text(text.to_string()))
        }

        pub fn with_reply(reply: QueryReply) -> Self {
            Self {
                reply: Mutex::new(reply),
                applied: Mutex::new(Vec::new()),
                failing: Vec::new(),
            }
        }

        pub fn set_text(&self, text: &str) {
            self.set_reply(QueryReply::Text(text.to_string()));
        }

        pub fn set_reply(&self, reply: QueryReply) {
            *self.reply.lock().unwrap() = reply;
        }

        pub fn applied(&self) -> Vec<Vec<String>> {
            self.applied.lock().unwrap().clone()
        }
    }

    impl RandrBackend for MockBackend {
        async fn query(&self) -> Result<String> {
            match &*self.reply.lock().unwrap() {
                QueryReply::Text(text) => Ok(text.clone()),
                QueryReply::Timeout => Err(ReconcileError::QueryTimeout(Duration::from_millis(5000))),
                QueryReply::Empty => Err(ReconcileError::QueryEmpty),
            }
        }

        async fn apply(&self, output: &str, request: &ApplyRequest) -> Result<()> {
            self.applied.lock().unwrap().push(apply_args(output, request));
            if self.failing.iter().any(|o| o == output) {
                return Err(ReconcileError::ApplyFailed { code: Some(1) });
            }
            Ok(())
        }
    }

    /// xrandr-style dump with one block per `(output, mode lines)` pair,
    /// mode lines separated by newlines
    pub fn dump(outputs: &[(&str, &str)]) -> String {
        let mut text =
            String::from("Screen 0: minimum 320 x 200, current 1920 x 1080, maximum 16384 x 16384\n");
        for (name, modes) in outputs {
            text.push_str(&format!(
                "{name} connected 1920x1080+0+0 (normal left inverted right) 0mm x 0mm\n"
            ));
            for line in modes.lines() {
                text.push_str(&format!("   {line}\n"));
            }
        }
        text
    }

    fn reconciler(backend: MockBackend) -> Reconciler<MockBackend> {
        Reconciler::new(backend, ModeSelector::new(Policy::default()))
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_scenario_a_preferred_mode_with_rate() {
        let text = dump(&[(
            "HDMI-1",
            "1920x1080     60.00*+  30.00    24.00\n1280x720      60.00",
        )]);
        let reconciler = reconciler(MockBackend::with_text(&text));

        let outcome = reconciler.reconcile_output("HDMI-1").await;

        assert_eq!(
            outcome.request,
            ApplyRequest::Mode {
                mode: Mode::new(1920, 1080, 30.0),
                with_rate: true
            }
        );
        assert!(outcome.fallback_reason.is_none());
        assert_eq!(
            reconciler.backend.applied(),
            [args(&["--output", "HDMI-1", "--mode", "1920x1080", "--rate", "30.00"])]
        );
    }

    #[tokio::test]
    async fn test_scenario_b_fallback_group_a_without_rate() {
        let text = dump(&[("HDMI-1", "1280x720      60.00\n1024x768      75.00")]);
        let reconciler = reconciler(MockBackend::with_text(&text));

        reconciler.reconcile_output("HDMI-1").await;

        assert_eq!(
            reconciler.backend.applied(),
            [args(&["--output", "HDMI-1", "--mode", "1024x768"])]
        );
    }

    #[tokio::test]
    async fn test_scenario_c_fallback_group_b() {
        let text = dump(&[("DP-1", "2560x1440     59.95*+")]);
        let reconciler = reconciler(MockBackend::with_text(&text));

        reconciler.reconcile_output("DP-1").await;

        assert_eq!(
            reconciler.backend.applied(),
            [args(&["--output", "DP-1", "--mode", "2560x1440"])]
        );
    }

    #[tokio::test]
    async fn test_scenario_d_query_timeout_falls_back_to_auto() {
        let reconciler = reconciler(MockBackend::with_reply(QueryReply::Timeout));

        let outcome = reconciler.reconcile_output("HDMI-1").await;

        assert!(matches!(
            outcome.fallback_reason,
            Some(ReconcileError::QueryTimeout(_))
        ));
        assert!(outcome.is_success());
        assert_eq!(
            reconciler.backend.applied(),
            [args(&["--output", "HDMI-1", "--auto"])]
        );
    }

    #[tokio::test]
    async fn test_scenario_e_missing_header_falls_back_to_auto() {
        let text = "Screen 0: minimum 320 x 200\nHDMI-1 disconnected (normal left inverted right)\n";
        let reconciler = reconciler(MockBackend::with_text(text));

        let outcome = reconciler.reconcile_output("HDMI-1").await;

        assert!(matches!(
            outcome.fallback_reason,
            Some(ReconcileError::HeaderNotFound(ref name)) if name == "HDMI-1"
        ));
        assert_eq!(
            reconciler.backend.applied(),
            [args(&["--output", "HDMI-1", "--auto"])]
        );
    }

    #[tokio::test]
    async fn test_empty_query_falls_back_to_auto() {
        let reconciler = reconciler(MockBackend::with_reply(QueryReply::Empty));
        let outcome = reconciler.reconcile_output("HDMI-1").await;
        assert!(matches!(outcome.fallback_reason, Some(ReconcileError::QueryEmpty)));
        assert_eq!(outcome.request, ApplyRequest::Auto);
    }

    #[tokio::test]
    async fn test_header_without_modes_falls_back_to_auto() {
        let text = dump(&[("HDMI-1", "not-a-mode  60.00")]);
        let reconciler = reconciler(MockBackend::with_text(&text));

        let outcome = reconciler.reconcile_output("HDMI-1").await;

        assert!(matches!(
            outcome.fallback_reason,
            Some(ReconcileError::NoModesParsed(_))
        ));
        assert_eq!(outcome.request, ApplyRequest::Auto);
    }

    #[tokio::test]
    async fn test_no_candidate_falls_back_to_auto() {
        let text = dump(&[("HDMI-1", "1920x1080     60.00    50.00")]);
        let reconciler = reconciler(MockBackend::with_text(&text));

        let outcome = reconciler.reconcile_output("HDMI-1").await;

        assert!(matches!(
            outcome.fallback_reason,
            Some(ReconcileError::SelectorNoCandidate)
        ));
        assert_eq!(
            reconciler.backend.applied(),
            [args(&["--output", "HDMI-1", "--auto"])]
        );
    }

    #[tokio::test]
    async fn test_apply_failure_is_not_retried() {
        let text = dump(&[("HDMI-1", "1280x720      60.00")]);
        let mut backend = MockBackend::with_text(&text);
        backend.failing.push("HDMI-1".into());
        let reconciler = reconciler(backend);

        let outcome = reconciler.reconcile_output("HDMI-1").await;

        assert!(matches!(
            outcome.applied,
            Err(ReconcileError::ApplyFailed { code: Some(1) })
        ));
        assert!(outcome.fallback_reason.is_none());
        // one attempt, no auto fallback after the failed apply
        assert_eq!(reconciler.backend.applied().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_remaining_outputs() {
        let text = dump(&[
            ("HDMI-1", "1920x1080     30.00"),
            ("DP-1", "1280x720      60.00"),
        ]);
        let mut backend = MockBackend::with_text(&text);
        backend.failing.push("HDMI-1".into());
        let reconciler = reconciler(backend);

        let report = reconciler.reconcile(["HDMI-1", "VGA-1", "DP-1"]).await;

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.failed(), 1);
        let applied = reconciler.backend.applied();
        assert_eq!(applied[0][1], "HDMI-1");
        assert_eq!(applied[1], args(&["--output", "VGA-1", "--auto"]));
        assert_eq!(applied[2], args(&["--output", "DP-1", "--mode", "1280x720"]));
    }

    #[tokio::test]
    async fn test_connected_outputs() {
        let mut text = dump(&[("HDMI-1", "1280x720 60.00"), ("eDP-1", "")]);
        text.push_str("DP-1 disconnected (normal left inverted right)\n");
        let reconciler = reconciler(MockBackend::with_text(&text));

        assert_eq!(reconciler.connected_outputs().await.unwrap(), ["HDMI-1", "eDP-1"]);
    }
}

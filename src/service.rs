// SPDX-License-Identifier: GPL-3.0-only
//! Display mode reconciliation service
//!
//! [`ModeService`] owns everything that keeps outputs at the target mode:
//!
//! - an event loop task that turns poll ticks and hotplug notifications into
//!   reconcile requests; it never runs external tools itself, so a stuck
//!   `xrandr` cannot delay hotplug intake;
//! - a worker task that runs passes strictly one after another, coalescing
//!   requests that pile up while a pass is running;
//! - the udev monitor thread, when hotplug support is enabled.
//!
//! The entry point constructs the service once, calls [`ModeService::start`]
//! and keeps it alive until shutdown.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{APPID, Config};
use crate::error::ServiceError;
use crate::hotplug::{HotplugEvent, HotplugMonitor, OutputTracker};
use crate::randr::RandrBackend;
use crate::reconciler::Reconciler;
use crate::selector::ModeSelector;

/// Why a pass was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Startup,
    Tick,
    Hotplug,
}

pub struct ModeService<B> {
    config: Config,
    reconciler: Arc<Reconciler<B>>,
    lock_path: Option<PathBuf>,
    running: Option<Running>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    #[cfg(test)]
    notify: mpsc::Sender<()>,
    event_loop: JoinHandle<()>,
    worker: JoinHandle<()>,
    hotplug: Option<HotplugMonitor>,
    _lock: Option<InstanceLock>,
}

impl<B: RandrBackend> ModeService<B> {
    pub fn new(config: Config, backend: B) -> Self {
        let reconciler = Reconciler::new(backend, ModeSelector::new(config.policy));
        Self {
            config,
            reconciler: Arc::new(reconciler),
            lock_path: Some(default_lock_path()),
            running: None,
        }
    }

    /// Use a different single-instance lock file, or none at all
    #[cfg(test)]
    fn with_lock_path(mut self, path: Option<PathBuf>) -> Self {
        self.lock_path = path;
        self
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start the loop and queue the startup pass over every connected output
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), ServiceError> {
        if self.running.is_some() {
            warn!("Display mode service already started");
            return Ok(());
        }

        let lock = self
            .lock_path
            .as_deref()
            .map(InstanceLock::acquire)
            .transpose()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // one pending notification is enough: the pass re-queries everything
        let (notify_tx, notify_rx) = mpsc::channel(1);
        let (request_tx, request_rx) = mpsc::channel(4);

        let _ = request_tx.try_send(Request::Startup);

        let worker = tokio::spawn(worker(
            self.reconciler.clone(),
            request_rx,
            self.config.hotplug_settle,
            shutdown_rx.clone(),
        ));
        let event_loop = tokio::spawn(event_loop(
            self.config.poll_interval,
            notify_rx,
            request_tx,
            shutdown_rx,
        ));

        let hotplug = if self.config.hotplug {
            match HotplugMonitor::start(notify_tx.clone()) {
                Ok(monitor) => Some(monitor),
                Err(e) => {
                    error!(
                        "Failed to initialize display hotplug monitoring: {}, relying on polling",
                        e
                    );
                    None
                }
            }
        } else {
            info!("Hotplug monitoring disabled by config");
            None
        };

        info!(
            "Display mode service started (target {}x{} <= {}Hz, poll every {:?})",
            self.config.policy.cap_width,
            self.config.policy.cap_height,
            self.config.policy.cap_rate_hz,
            self.config.poll_interval
        );

        self.running = Some(Running {
            shutdown: shutdown_tx,
            #[cfg(test)]
            notify: notify_tx,
            event_loop,
            worker,
            hotplug,
            _lock: lock,
        });
        Ok(())
    }

    /// Report a display hotplug; the udev thread uses the same channel
    #[cfg(test)]
    fn notify_hotplug(&self) -> bool {
        match &self.running {
            Some(running) => !matches!(
                running.notify.try_send(()),
                Err(mpsc::error::TrySendError::Closed(()))
            ),
            None => false,
        }
    }

    /// Stop all tasks and the monitor thread; a no-op when not running
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.shutdown.send(true);

        if let Some(hotplug) = running.hotplug {
            // joining waits for the current poll() timeout
            let _ = tokio::task::spawn_blocking(move || hotplug.stop()).await;
        }
        if let Err(e) = running.event_loop.await {
            error!("Event loop task failed: {}", e);
        }
        if let Err(e) = running.worker.await {
            error!("Reconcile worker task failed: {}", e);
        }

        info!("Display mode service stopped");
    }

    #[cfg(test)]
    fn reconciler(&self) -> &Reconciler<B> {
        &self.reconciler
    }
}

/// Poll scheduler and hotplug intake
async fn event_loop(
    poll_interval: Duration,
    mut notify: mpsc::Receiver<()>,
    requests: mpsc::Sender<Request>,
    mut shutdown: watch::Receiver<bool>,
) {
    // the startup pass is already queued, so skip the immediate first tick
    let mut poll = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(()) = notify.recv() => {
                info!("Hotplug event received");
                Request::Hotplug
            }
            _ = poll.tick() => Request::Tick,
        };

        match requests.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(request)) => {
                debug!("Reconcile queue full, dropping {:?} request", request);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }

    debug!("Event loop stopped");
}

/// Runs passes one at a time until shutdown
async fn worker<B: RandrBackend>(
    reconciler: Arc<Reconciler<B>>,
    mut requests: mpsc::Receiver<Request>,
    hotplug_settle: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tracker = OutputTracker::new();

    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let pass = async {
            if first == Request::Hotplug && !hotplug_settle.is_zero() {
                debug!("Waiting {:?} for hardware to settle", hotplug_settle);
                tokio::time::sleep(hotplug_settle).await;
            }

            // Coalesce: anything queued meanwhile is covered by this pass
            let mut full = first != Request::Hotplug;
            let mut drained = 0;
            while let Ok(request) = requests.try_recv() {
                full |= request != Request::Hotplug;
                drained += 1;
            }
            if drained > 0 {
                debug!("Coalesced {} queued request(s)", drained);
            }

            run_pass(&reconciler, &mut tracker, full).await;
        };

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = pass => {}
        }
    }

    debug!("Reconcile worker stopped");
}

/// One reconciliation pass
///
/// A full pass (startup, tick) reconciles every connected output. A hotplug
/// pass reconciles only outputs that appeared since the previous query;
/// removals are logged and nothing else. A hotplug pass that sees no change
/// at all (an output unplugged and replugged between two queries) is treated
/// as a full pass.
///
/// When the output list itself cannot be queried, a full pass reconciles the
/// outputs known from the last successful list, each of which then falls back
/// to the automatic configuration. With no successful list yet there is
/// nothing to reconcile and the next tick retries.
async fn run_pass<B: RandrBackend>(
    reconciler: &Reconciler<B>,
    tracker: &mut OutputTracker,
    full: bool,
) {
    let outputs = match reconciler.connected_outputs().await {
        Ok(outputs) => outputs,
        Err(err) => {
            warn!("Failed to list outputs: {}", err);
            if !full {
                return;
            }
            let known: Vec<String> = tracker.known().map(str::to_string).collect();
            if known.is_empty() {
                warn!("No known outputs to fall back on, waiting for the next poll");
                return;
            }
            reconciler.reconcile(&known).await;
            return;
        }
    };

    let events = tracker.update(outputs.iter().cloned());
    let full = full || events.is_empty();

    let mut added = Vec::new();
    for event in events {
        match event {
            HotplugEvent::Added(name) => {
                info!("Output attached: {}", name);
                added.push(name);
            }
            HotplugEvent::Removed(name) => info!("Output removed: {}", name),
        }
    }

    let targets = if full { outputs } else { added };
    if targets.is_empty() {
        debug!("No outputs to reconcile");
        return;
    }
    reconciler.reconcile(&targets).await;
}

fn default_lock_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(format!("{APPID}.lock"))
}

/// Exclusive `flock` on a file, held for as long as the service runs
struct InstanceLock {
    _file: File,
}

impl InstanceLock {
    fn acquire(path: &Path) -> Result<Self, ServiceError> {
        let file = File::create(path)?;

        let lock_result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if lock_result != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(ServiceError::AlreadyRunning(path.to_path_buf()));
            }
            return Err(err.into());
        }

        debug!("Acquired instance lock {}", path.display());
        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::tests::{MockBackend, QueryReply, dump};

    fn test_config(poll_interval: Duration) -> Config {
        Config {
            poll_interval,
            hotplug_settle: Duration::ZERO,
            hotplug: false,
            ..Config::default()
        }
    }

    fn service(config: Config, text: &str) -> ModeService<MockBackend> {
        ModeService::new(config, MockBackend::with_text(text)).with_lock_path(None)
    }

    fn applied_to(service: &ModeService<MockBackend>, output: &str) -> usize {
        service
            .reconciler()
            .backend()
            .applied()
            .iter()
            .filter(|args| args[1] == output)
            .count()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 3s");
    }

    #[tokio::test]
    async fn test_startup_pass_covers_every_connected_output() {
        let text = dump(&[("HDMI-1", "1920x1080 60.00 30.00"), ("DP-1", "1280x720 60.00")]);
        let mut service = service(test_config(Duration::from_secs(3600)), &text);

        service.start().unwrap();
        wait_until(|| service.reconciler().backend().applied().len() == 2).await;
        service.stop().await;

        let applied = service.reconciler().backend().applied();
        assert_eq!(
            applied[0],
            ["--output", "HDMI-1", "--mode", "1920x1080", "--rate", "30.00"]
        );
        assert_eq!(applied[1], ["--output", "DP-1", "--mode", "1280x720"]);
    }

    #[tokio::test]
    async fn test_poll_ticks_reapply() {
        let text = dump(&[("HDMI-1", "1280x720 60.00")]);
        let mut service = service(test_config(Duration::from_millis(20)), &text);

        service.start().unwrap();
        wait_until(|| applied_to(&service, "HDMI-1") >= 3).await;
        service.stop().await;
    }

    #[tokio::test]
    async fn test_hotplug_add_reconciles_only_the_new_output() {
        let mut service = service(
            test_config(Duration::from_secs(3600)),
            &dump(&[("HDMI-1", "1280x720 60.00")]),
        );

        service.start().unwrap();
        wait_until(|| applied_to(&service, "HDMI-1") == 1).await;

        service
            .reconciler()
            .backend()
            .set_text(&dump(&[("HDMI-1", "1280x720 60.00"), ("DP-1", "2560x1440 60.00")]));
        assert!(service.notify_hotplug());
        wait_until(|| applied_to(&service, "DP-1") == 1).await;
        service.stop().await;

        assert_eq!(applied_to(&service, "HDMI-1"), 1);
        assert_eq!(
            service.reconciler().backend().applied()[1],
            ["--output", "DP-1", "--mode", "2560x1440"]
        );
    }

    #[tokio::test]
    async fn test_hotplug_remove_applies_nothing() {
        let mut service = service(
            test_config(Duration::from_secs(3600)),
            &dump(&[("HDMI-1", "1280x720 60.00"), ("DP-1", "1280x720 60.00")]),
        );

        service.start().unwrap();
        wait_until(|| service.reconciler().backend().applied().len() == 2).await;

        service
            .reconciler()
            .backend()
            .set_text(&dump(&[("HDMI-1", "1280x720 60.00")]));
        assert!(service.notify_hotplug());
        tokio::time::sleep(Duration::from_millis(200)).await;
        service.stop().await;

        assert_eq!(service.reconciler().backend().applied().len(), 2);
    }

    #[tokio::test]
    async fn test_hotplug_without_change_reconciles_every_output() {
        let mut service = service(
            test_config(Duration::from_secs(3600)),
            &dump(&[("HDMI-1", "1280x720 60.00"), ("DP-1", "1280x720 60.00")]),
        );

        service.start().unwrap();
        wait_until(|| service.reconciler().backend().applied().len() == 2).await;

        // same names as before: unplugged and replugged between two queries
        assert!(service.notify_hotplug());
        wait_until(|| service.reconciler().backend().applied().len() == 4).await;
        service.stop().await;

        assert_eq!(applied_to(&service, "HDMI-1"), 2);
        assert_eq!(applied_to(&service, "DP-1"), 2);
    }

    #[tokio::test]
    async fn test_list_failure_falls_back_to_auto_for_known_outputs() {
        let mut service = service(
            test_config(Duration::from_millis(20)),
            &dump(&[("HDMI-1", "1280x720 60.00")]),
        );

        service.start().unwrap();
        wait_until(|| applied_to(&service, "HDMI-1") >= 1).await;

        service.reconciler().backend().set_reply(QueryReply::Timeout);
        wait_until(|| {
            service
                .reconciler()
                .backend()
                .applied()
                .iter()
                .any(|args| args == &["--output", "HDMI-1", "--auto"])
        })
        .await;
        service.stop().await;
    }

    #[tokio::test]
    async fn test_list_failure_before_any_listing_applies_nothing() {
        let mut service = ModeService::new(
            test_config(Duration::from_millis(20)),
            MockBackend::with_reply(QueryReply::Timeout),
        )
        .with_lock_path(None);

        service.start().unwrap();
        // startup pass plus several ticks
        tokio::time::sleep(Duration::from_millis(200)).await;
        service.stop().await;

        assert!(service.reconciler().backend().applied().is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut service = service(test_config(Duration::from_secs(3600)), "");
        assert!(!service.notify_hotplug());
        service.stop().await;

        service.start().unwrap();
        assert!(service.is_running());
        service.stop().await;
        service.stop().await;
        assert!(!service.is_running());
        assert!(!service.notify_hotplug());
    }

    #[tokio::test]
    async fn test_second_instance_is_rejected() {
        let path = std::env::temp_dir().join(format!("{APPID}-test-{}.lock", std::process::id()));
        let config = test_config(Duration::from_secs(3600));

        let mut first = service(config.clone(), "").with_lock_path(Some(path.clone()));
        let mut second = service(config.clone(), "").with_lock_path(Some(path.clone()));

        first.start().unwrap();
        assert!(matches!(
            second.start(),
            Err(ServiceError::AlreadyRunning(_))
        ));
        first.stop().await;

        // lock released on stop
        second.start().unwrap();
        second.stop().await;
        let _ = std::fs::remove_file(&path);
    }
}

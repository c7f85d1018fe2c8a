// SPDX-License-Identifier: GPL-3.0-only
//! Display hotplug detection
//!
//! udev tells us *that* something changed on the DRM bus, not which output
//! name the display tool will use for it. The monitor thread therefore only
//! sends a bare notification; the reconcile worker re-queries the outputs and
//! lets [`OutputTracker`] turn the difference into add/remove events.

#[cfg(feature = "udev-hotplug")]
mod udev_monitor;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use tokio::sync::mpsc;

/// Attach/detach of a named output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    Added(String),
    Removed(String),
}

/// Names of the outputs that were connected at the previous query
///
/// Holds names only, never modes.
#[derive(Debug, Default)]
pub struct OutputTracker {
    known: BTreeSet<String>,
}

impl OutputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the known set and report what changed, removals first
    pub fn update<I>(&mut self, current: I) -> Vec<HotplugEvent>
    where
        I: IntoIterator<Item = String>,
    {
        let current: BTreeSet<String> = current.into_iter().collect();

        let removed = self
            .known
            .difference(&current)
            .cloned()
            .map(HotplugEvent::Removed);
        let added = current
            .difference(&self.known)
            .cloned()
            .map(HotplugEvent::Added);
        let events = removed.chain(added).collect();

        self.known = current;
        events
    }

    pub fn known(&self) -> impl Iterator<Item = &str> {
        self.known.iter().map(String::as_str)
    }
}

/// Handle to the udev monitoring thread
pub struct HotplugMonitor {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HotplugMonitor {
    /// Start watching udev in a background thread
    ///
    /// Every display event becomes one `()` on `notify`. A full channel means
    /// a pass is already pending, so the event is dropped.
    #[cfg(feature = "udev-hotplug")]
    pub fn start(notify: mpsc::Sender<()>) -> std::io::Result<Self> {
        use udev_monitor::UdevMonitor;

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();

        // MonitorSocket is not Send, so it is created on the thread itself;
        // report construction errors back before returning.
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let handle = std::thread::Builder::new()
            .name("udev-hotplug".into())
            .spawn(move || {
                let monitor = match UdevMonitor::new() {
                    Ok(m) => {
                        let _ = ready_tx.send(Ok(()));
                        m
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let result = monitor.run(thread_running, |_event| match notify.try_send(()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(())) => {
                        debug!("Hotplug channel full, coalescing event");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(())) => {
                        debug!("Hotplug channel closed, stopping monitor");
                        false
                    }
                });

                if let Err(e) = result {
                    error!("Display hotplug monitoring failed: {}", e);
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                running,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(std::io::Error::other("udev monitor thread exited early")),
        }
    }

    #[cfg(not(feature = "udev-hotplug"))]
    pub fn start(_notify: mpsc::Sender<()>) -> std::io::Result<Self> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "built without udev hotplug support",
        ))
    }

    /// Stop the monitor thread and wait for it to exit
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HotplugMonitor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

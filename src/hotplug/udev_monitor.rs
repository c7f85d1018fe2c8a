use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// How long one `poll()` waits before the stop flag is checked again
const POLL_TIMEOUT_MS: i32 = 500;

/// Watches udev for DRM connector events
///
/// This runs in a dedicated thread because udev's MonitorSocket is not Send.
/// It uses libc::poll() to wait for events on the udev socket.
pub struct UdevMonitor {
    socket: udev::MonitorSocket,
}

impl UdevMonitor {
    /// Create a new udev monitor for display events
    ///
    /// Filters on the DRM subsystem with the `drm_minor` device type, which is
    /// where connector hotplug uevents are reported.
    pub fn new() -> Result<Self, std::io::Error> {
        let socket = udev::MonitorBuilder::new()?
            .match_subsystem_devtype("drm", "drm_minor")?
            .listen()?;

        Ok(Self { socket })
    }

    /// Run the monitoring loop, calling `callback` for each display event
    ///
    /// Blocks until `running` is cleared, the callback returns false, or
    /// `poll()` fails.
    pub fn run<F>(self, running: Arc<AtomicBool>, mut callback: F) -> std::io::Result<()>
    where
        F: FnMut(&udev::Event) -> bool,
    {
        info!("Display hotplug monitoring started (drm/drm_minor)");

        let fd = self.socket.as_raw_fd();

        while running.load(Ordering::Relaxed) {
            let mut poll_fd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };

            let poll_result = unsafe { libc::poll(&mut poll_fd, 1, POLL_TIMEOUT_MS) };

            if poll_result < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!("Poll error: {}", err);
                return Err(err);
            }

            if poll_result == 0 {
                continue;
            }

            for event in self.socket.iter() {
                match event.event_type() {
                    udev::EventType::Add | udev::EventType::Remove | udev::EventType::Change => {
                        debug!(
                            "udev event: type={:?}, syspath={:?}",
                            event.event_type(),
                            event.syspath()
                        );
                        if !callback(&event) {
                            info!("Display hotplug monitoring stopped by callback");
                            return Ok(());
                        }
                    }
                    _ => {}
                }
            }
        }

        info!("Display hotplug monitoring stopped");
        Ok(())
    }
}

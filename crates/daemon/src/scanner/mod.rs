//! USB barcode scanner with session-based activation and USB power control
//!
//! The scanner worker runs on a dedicated blocking thread:
//! 1. On startup, discovers the scanner to learn its USB topology id, then
//!    powers the port off (standby).
//! 2. When a POS scan session activates, powers the port on, waits for the
//!    device to reappear, and reads barcodes until the session ends.
//! 3. When the session deactivates, powers the port off again.
//!
//! Completed reads cross to the Tokio side over the scan bridge, tagged
//! with the session generation active at read time.

mod worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use common::{PowerState, ScanSender, ScannerStatus};
use tracing::{info, warn};

use crate::usb::{PowerControl, UsbDiscovery};
use worker::ScannerWorker;

/// Timing knobs for the scanner worker. Defaults mirror production
/// behavior; tests shrink them.
#[derive(Debug, Clone)]
pub struct ScannerTimings {
    /// How often to re-scan for the device when not connected.
    pub discovery_interval: Duration,
    /// How long to wait after powering on before starting discovery.
    pub power_on_settle: Duration,
    /// How often to check for session changes when idle.
    pub idle_check_interval: Duration,
    /// Timeout for a single HID report read.
    pub read_timeout: Duration,
    /// Spacing between discovery attempts after power on.
    pub reconnect_spacing: Duration,
    /// Max discovery attempts after power on.
    pub reconnect_attempts: u32,
    /// Discovery attempts during the startup pass.
    pub initial_discovery_attempts: u32,
    /// Bound on joining the worker thread in stop().
    pub stop_join_timeout: Duration,
}

impl Default for ScannerTimings {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(3),
            power_on_settle: Duration::from_millis(1500),
            idle_check_interval: Duration::from_millis(500),
            read_timeout: Duration::from_secs(1),
            reconnect_spacing: Duration::from_secs(1),
            reconnect_attempts: 5,
            initial_discovery_attempts: 10,
            stop_join_timeout: Duration::from_secs(5),
        }
    }
}

/// The installed scan session. Displaced wholesale by activate_session, so
/// the worker always observes a consistent id/generation pair.
#[derive(Debug, Clone)]
struct ActiveSession {
    session_id: String,
    generation: u64,
}

/// Device facts learned by discovery plus the last observed power state.
#[derive(Debug, Clone)]
struct DeviceState {
    path: Option<PathBuf>,
    name: String,
    usb_port: Option<String>,
    power_state: PowerState,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            path: None,
            name: "Barcode Scanner".to_string(),
            usb_port: None,
            power_state: PowerState::Unknown,
        }
    }
}

/// State shared between the handle and the worker thread.
#[derive(Debug, Default)]
struct Shared {
    running: AtomicBool,
    connected: AtomicBool,
    generation: AtomicU64,
    session: Mutex<Option<ActiveSession>>,
    device: Mutex<DeviceState>,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn session(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device(&self) -> MutexGuard<'_, DeviceState> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_active(&self) -> bool {
        self.session().is_some()
    }
}

struct WorkerHandle {
    thread: thread::JoinHandle<()>,
    /// Closed when the worker closure exits, panic included. Lets stop()
    /// bound the join without blocking on a wedged thread.
    done_rx: mpsc::Receiver<()>,
}

/// Manages a USB barcode scanner with auto-discovery, session-based
/// reading, and USB power control.
pub struct BarcodeScanner {
    shared: Arc<Shared>,
    discovery: UsbDiscovery,
    power: Arc<dyn PowerControl>,
    scans: ScanSender,
    timings: ScannerTimings,
    worker: Mutex<Option<WorkerHandle>>,
}

impl BarcodeScanner {
    pub fn new(
        discovery: UsbDiscovery,
        power: Arc<dyn PowerControl>,
        scans: ScanSender,
        timings: ScannerTimings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            discovery,
            power,
            scans,
            timings,
            worker: Mutex::new(None),
        }
    }

    /// Start the background scanner thread. A no-op when already running.
    pub fn start(&self) -> common::Result<()> {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        self.shared.running.store(true, Ordering::Release);

        let (done_tx, done_rx) = mpsc::channel();
        let worker = ScannerWorker::new(
            Arc::clone(&self.shared),
            self.discovery.clone(),
            Arc::clone(&self.power),
            self.scans.clone(),
            self.timings.clone(),
        );

        let spawned = thread::Builder::new()
            .name("barcode-scanner".to_string())
            .spawn(move || {
                let _done = done_tx;
                worker.run();
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                return Err(err.into());
            }
        };

        *slot = Some(WorkerHandle { thread, done_rx });
        info!("Barcode scanner thread started");
        Ok(())
    }

    /// Stop the background scanner thread and power on USB (safe state).
    ///
    /// Joins the worker with a bounded timeout; a thread stuck past the
    /// timeout is detached rather than waited on.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            match handle.done_rx.recv_timeout(self.timings.stop_join_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if handle.thread.join().is_err() {
                        warn!("Scanner worker panicked during shutdown");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "Scanner worker did not exit within {:?}, detaching",
                        self.timings.stop_join_timeout
                    );
                }
            }
        }

        // Power on USB on shutdown so the device stays accessible
        let usb_port = self.shared.device().usb_port.clone();
        if let Some(port) = usb_port {
            self.power.power_on(Some(&port));
            self.shared.device().power_state = PowerState::On;
        }

        self.shared.connected.store(false, Ordering::Release);
        *self.shared.session() = None;
        info!("Barcode scanner stopped");
    }

    /// Activate a scan session. Powers on USB and starts scanning on the
    /// worker's next iteration; any prior session is displaced.
    ///
    /// Returns the new session generation; scans emitted for this session
    /// carry it, so the consumer can discard reads from older sessions.
    pub fn activate_session(&self, session_id: &str) -> u64 {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.shared.session() = Some(ActiveSession {
            session_id: session_id.to_string(),
            generation,
        });
        info!("Scan session activated: {}", session_id);
        generation
    }

    /// Deactivate the current scan session. The worker powers off USB on
    /// its next iteration.
    pub fn deactivate_session(&self) {
        let was_active = self.shared.session().take().is_some();
        if was_active {
            info!("Scan session deactivated");
        }
    }

    pub fn session_active(&self) -> bool {
        self.shared.session_active()
    }

    /// Snapshot of the scanner state for the status surface.
    pub fn status(&self) -> ScannerStatus {
        let device = self.shared.device().clone();
        let session = self.shared.session().clone();

        ScannerStatus {
            connected: self.shared.connected.load(Ordering::Acquire),
            device_path: device
                .path
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "auto".to_string()),
            name: device.name,
            session_active: session.is_some(),
            session_id: session.map(|s| s.session_id),
            power_state: device.power_state,
            usb_port: device.usb_port,
        }
    }
}

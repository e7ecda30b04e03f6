//! Scanner worker thread
//!
//! Runs the two-phase lifecycle: a one-time startup discovery pass to learn
//! the device's USB topology id, then the session-driven loop that powers
//! the port, reads reports, and powers it back off. All blocking I/O stays
//! on this thread.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use chrono::Local;
use common::{PowerState, ScanEntry, ScanSender, TaggedScan};
use tracing::{debug, error, info, warn};

use super::{ActiveSession, ScannerTimings, Shared};
use crate::usb::hid::{self, HID_REPORT_SIZE, ReportRead, SCANCODE_ENTER};
use crate::usb::{DiscoveredDevice, PowerControl, UsbDiscovery};

pub(super) struct ScannerWorker {
    shared: Arc<Shared>,
    discovery: UsbDiscovery,
    power: Arc<dyn PowerControl>,
    scans: ScanSender,
    timings: ScannerTimings,
}

impl ScannerWorker {
    pub(super) fn new(
        shared: Arc<Shared>,
        discovery: UsbDiscovery,
        power: Arc<dyn PowerControl>,
        scans: ScanSender,
        timings: ScannerTimings,
    ) -> Self {
        Self {
            shared,
            discovery,
            power,
            scans,
            timings,
        }
    }

    pub(super) fn run(self) {
        // Phase 1: learn the device's USB ids while power is still on
        self.initial_discovery();

        // Phase 2: session-driven power and reading
        while self.shared.is_running() {
            let iteration = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                if self.shared.session_active() {
                    self.handle_active_session();
                } else {
                    self.idle_step();
                }
            }));

            if let Err(e) = iteration {
                error!("Scanner loop error: {:?}", e);
                self.shared.connected.store(false, Ordering::Release);
                thread::sleep(self.timings.discovery_interval);
            }
        }
    }

    /// Startup pass: discover the scanner to learn its topology id and
    /// name, then power the port off. Without the topology id there is
    /// nothing to unbind against, so on failure the port is left alone and
    /// discovery happens again when a session starts.
    fn initial_discovery(&self) {
        info!("Initial scanner discovery (USB powered on)...");

        for attempt in 0..self.timings.initial_discovery_attempts {
            if !self.shared.is_running() {
                return;
            }

            if let Some(discovered) = self.discovery.find_barcode_scanner() {
                self.record_device(&discovered);
                self.shared.connected.store(true, Ordering::Release);
                info!(
                    "Scanner discovered: {} at {} (usb={})",
                    discovered.name,
                    discovered.hidraw_path.display(),
                    discovered.usb_port
                );
                // Standby until a session needs the device
                self.power_off();
                self.shared.connected.store(false, Ordering::Release);
                return;
            }

            debug!("Discovery attempt {}: no scanner found", attempt + 1);
            thread::sleep(self.timings.discovery_interval);
        }

        warn!(
            "Initial discovery failed after {} attempts. \
             Scanner will be discovered when a session starts.",
            self.timings.initial_discovery_attempts
        );
    }

    /// Idle iteration: keep the port powered off, then sleep briefly
    /// before rechecking the session slot.
    fn idle_step(&self) {
        let needs_power_off = {
            let device = self.shared.device();
            device.power_state != PowerState::Off && device.usb_port.is_some()
        };
        if needs_power_off {
            self.power_off();
        }
        thread::sleep(self.timings.idle_check_interval);
    }

    /// One active-session cycle: power on, rediscover, read barcodes until
    /// the session ends or the device disappears, power off.
    fn handle_active_session(&self) {
        self.power_on();
        thread::sleep(self.timings.power_on_settle);

        let discovered = match self.wait_for_device() {
            Some(discovered) => discovered,
            None => {
                warn!("Scanner not found after power on");
                thread::sleep(self.timings.discovery_interval);
                return;
            }
        };

        self.record_device(&discovered);
        self.shared.connected.store(true, Ordering::Release);

        // Power-off must run even if the read loop panics; re-raise after
        // so the outer handler logs it.
        let read = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.read_barcodes(&discovered.hidraw_path);
        }));

        self.shared.connected.store(false, Ordering::Release);
        self.power_off();

        if let Err(e) = read {
            std::panic::resume_unwind(e);
        }
    }

    /// Wait for the scanner to reappear after power on.
    fn wait_for_device(&self) -> Option<DiscoveredDevice> {
        for attempt in 0..self.timings.reconnect_attempts {
            if !self.shared.is_running() || !self.shared.session_active() {
                return None;
            }

            if let Some(discovered) = self.discovery.find_barcode_scanner() {
                return Some(discovered);
            }

            debug!(
                "Waiting for scanner (attempt {}/{})...",
                attempt + 1,
                self.timings.reconnect_attempts
            );
            thread::sleep(self.timings.reconnect_spacing);
        }

        None
    }

    /// Open the HID device and read barcodes while the session is active.
    fn read_barcodes(&self, device_path: &Path) {
        info!("Opening scanner {} for barcode reading", device_path.display());

        let mut device = match File::open(device_path) {
            Ok(device) => device,
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                error!(
                    "Permission denied reading {} - ensure the daemon can access hidraw devices",
                    device_path.display()
                );
                return;
            }
            Err(err) => {
                warn!("Scanner device error: {}", err);
                return;
            }
        };

        // Discard reports queued while no session was active
        if let Err(err) = hid::flush_input(&mut device) {
            warn!("Scanner device error: {}", err);
            return;
        }

        let mut barcode = String::new();
        let mut session = match self.shared.session().clone() {
            Some(session) => session,
            None => return,
        };

        while self.shared.is_running() {
            if !self.sync_session(&mut barcode, &mut session) {
                return;
            }

            if !device_path.exists() {
                warn!("Scanner device {} lost", device_path.display());
                return;
            }

            match hid::read_report_timeout(&mut device, self.timings.read_timeout) {
                Ok(ReportRead::TimedOut) => continue,
                Ok(ReportRead::Disconnected) => {
                    warn!("Scanner device {} lost during read", device_path.display());
                    return;
                }
                Ok(ReportRead::Report(data)) => self.handle_report(&data, &mut barcode, &session),
                Err(err) => {
                    warn!("Scanner device error: {}", err);
                    return;
                }
            }
        }
    }

    /// Refresh the worker's local view of the active session. A session
    /// swap discards any partially accumulated barcode; a missing session
    /// ends the read.
    fn sync_session(&self, barcode: &mut String, session: &mut ActiveSession) -> bool {
        let current = match self.shared.session().clone() {
            Some(current) => current,
            None => return false,
        };
        if session.generation != current.generation {
            if !barcode.is_empty() {
                debug!("Session changed mid-read, discarding partial input");
                barcode.clear();
            }
            *session = current;
        }
        true
    }

    /// Fold one report into the barcode buffer, emitting on Enter.
    fn handle_report(
        &self,
        data: &[u8; HID_REPORT_SIZE],
        barcode: &mut String,
        session: &ActiveSession,
    ) {
        let scancode = data[2];

        // Key release
        if scancode == 0 {
            return;
        }

        if scancode == SCANCODE_ENTER {
            let finished = barcode.trim().to_string();
            barcode.clear();
            if !finished.is_empty() {
                self.emit_scan(finished, session);
            }
            return;
        }

        if let Some(ch) = hid::decode_report(data) {
            barcode.push(ch);
        }
    }

    /// Tag a completed read and push it onto the scan bridge. The tag is
    /// the session synced before the report was read, not the live slot;
    /// a scan finishing after a swap keeps the old generation so the
    /// consumer drops it instead of crediting it to the new session.
    fn emit_scan(&self, barcode: String, session: &ActiveSession) {
        info!("Barcode scanned: {}", barcode);

        let entry = ScanEntry {
            barcode,
            timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            device: self.shared.device().name.clone(),
        };

        let scan = TaggedScan {
            entry,
            session_id: session.session_id.clone(),
            generation: session.generation,
        };
        if let Err(err) = self.scans.try_send(scan) {
            warn!("Scan bridge rejected barcode, dropping: {}", err);
        }
    }

    fn record_device(&self, discovered: &DiscoveredDevice) {
        let mut device = self.shared.device();
        device.path = Some(discovered.hidraw_path.clone());
        device.name = discovered.name.clone();
        device.usb_port = Some(discovered.usb_port.clone());
    }

    fn power_on(&self) {
        let usb_port = self.shared.device().usb_port.clone();
        if self.power.power_on(usb_port.as_deref()) {
            self.shared.device().power_state = PowerState::On;
            info!("USB power ON (port={})", usb_port.as_deref().unwrap_or("unknown"));
        } else {
            warn!("USB power ON failed");
        }
    }

    fn power_off(&self) {
        let usb_port = self.shared.device().usb_port.clone();
        if self.power.power_off(usb_port.as_deref()) {
            self.shared.device().power_state = PowerState::Off;
            info!("USB power OFF (port={})", usb_port.as_deref().unwrap_or("unknown"));
        } else {
            warn!("USB power OFF failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ScanReceiver, scan_channel};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingPower {
        ops: Mutex<Vec<String>>,
    }

    impl RecordingPower {
        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }
    }

    impl PowerControl for RecordingPower {
        fn power_on(&self, usb_port: Option<&str>) -> bool {
            self.ops
                .lock()
                .unwrap()
                .push(format!("on:{}", usb_port.unwrap_or("-")));
            true
        }

        fn power_off(&self, usb_port: Option<&str>) -> bool {
            self.ops
                .lock()
                .unwrap()
                .push(format!("off:{}", usb_port.unwrap_or("-")));
            true
        }
    }

    fn test_timings() -> ScannerTimings {
        ScannerTimings {
            discovery_interval: Duration::from_millis(1),
            power_on_settle: Duration::from_millis(1),
            idle_check_interval: Duration::from_millis(1),
            read_timeout: Duration::from_millis(10),
            reconnect_spacing: Duration::from_millis(1),
            reconnect_attempts: 2,
            initial_discovery_attempts: 1,
            stop_join_timeout: Duration::from_secs(1),
        }
    }

    fn test_worker() -> (ScannerWorker, Arc<Shared>, Arc<RecordingPower>, ScanReceiver) {
        let shared = Arc::new(Shared::default());
        let power = Arc::new(RecordingPower::default());
        let (tx, rx) = scan_channel();
        let worker = ScannerWorker::new(
            Arc::clone(&shared),
            UsbDiscovery::with_roots("/nonexistent/sysfs", "/nonexistent/dev"),
            Arc::clone(&power) as Arc<dyn PowerControl>,
            tx,
            test_timings(),
        );
        (worker, shared, power, rx)
    }

    fn install_session(shared: &Shared, session_id: &str, generation: u64) -> ActiveSession {
        let session = ActiveSession {
            session_id: session_id.to_string(),
            generation,
        };
        *shared.session() = Some(session.clone());
        session
    }

    fn report(modifier: u8, keycode: u8) -> [u8; HID_REPORT_SIZE] {
        [modifier, 0, keycode, 0, 0, 0, 0, 0]
    }

    #[test]
    fn test_reports_accumulate_into_scan() {
        let (worker, shared, _power, rx) = test_worker();
        let session = install_session(&shared, "session-1", 7);

        let mut barcode = String::new();
        // "hello" one report per key, with key releases between
        for keycode in [0x0b, 0x08, 0x0f, 0x0f, 0x12] {
            worker.handle_report(&report(0, keycode), &mut barcode, &session);
            worker.handle_report(&report(0, 0), &mut barcode, &session);
        }
        worker.handle_report(&report(0, SCANCODE_ENTER), &mut barcode, &session);

        let scan = rx.try_recv().expect("scan should be emitted");
        assert_eq!(scan.entry.barcode, "hello");
        assert_eq!(scan.entry.device, "Barcode Scanner");
        assert_eq!(scan.session_id, "session-1");
        assert_eq!(scan.generation, 7);
        assert!(barcode.is_empty());
    }

    #[test]
    fn test_shifted_reports_uppercase() {
        let (worker, shared, _power, rx) = test_worker();
        let session = install_session(&shared, "session-1", 1);

        let mut barcode = String::new();
        worker.handle_report(&report(0x02, 0x04), &mut barcode, &session);
        worker.handle_report(&report(0x00, 0x05), &mut barcode, &session);
        worker.handle_report(&report(0, SCANCODE_ENTER), &mut barcode, &session);

        assert_eq!(rx.try_recv().unwrap().entry.barcode, "Ab");
    }

    #[test]
    fn test_enter_with_empty_buffer_emits_nothing() {
        let (worker, shared, _power, rx) = test_worker();
        let session = install_session(&shared, "session-1", 1);

        let mut barcode = String::new();
        worker.handle_report(&report(0, SCANCODE_ENTER), &mut barcode, &session);
        // Whitespace-only input trims to empty as well
        worker.handle_report(&report(0, 0x2c), &mut barcode, &session);
        worker.handle_report(&report(0, SCANCODE_ENTER), &mut barcode, &session);

        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_session_swap_discards_partial_input() {
        let (worker, shared, _power, rx) = test_worker();
        let mut session = install_session(&shared, "session-1", 1);

        let mut barcode = String::new();
        assert!(worker.sync_session(&mut barcode, &mut session));
        worker.handle_report(&report(0, 0x04), &mut barcode, &session);
        assert_eq!(barcode, "a");

        // A new session replaces the old one between reports
        install_session(&shared, "session-2", 2);
        assert!(worker.sync_session(&mut barcode, &mut session));
        assert!(barcode.is_empty());
        assert_eq!(session.generation, 2);

        worker.handle_report(&report(0, 0x05), &mut barcode, &session);
        worker.handle_report(&report(0, SCANCODE_ENTER), &mut barcode, &session);

        let scan = rx.try_recv().expect("scan should be emitted");
        assert_eq!(scan.entry.barcode, "b");
        assert_eq!(scan.session_id, "session-2");
        assert_eq!(scan.generation, 2);
    }

    #[test]
    fn test_swap_during_blocked_read_keeps_read_time_tag() {
        let (worker, shared, _power, rx) = test_worker();
        let mut session = install_session(&shared, "session-1", 1);

        // "12" accumulated under session-1, syncing before each report as
        // the read loop does
        let mut barcode = String::new();
        assert!(worker.sync_session(&mut barcode, &mut session));
        worker.handle_report(&report(0, 0x1e), &mut barcode, &session);
        assert!(worker.sync_session(&mut barcode, &mut session));
        worker.handle_report(&report(0, 0x1f), &mut barcode, &session);

        // The poller swaps sessions while the worker sits in a blocked
        // read: no sync runs between the swap and the Enter delivered by
        // that same read
        install_session(&shared, "session-2", 2);
        worker.handle_report(&report(0, SCANCODE_ENTER), &mut barcode, &session);

        // The scan keeps the tag it was read under, so the consumer's
        // generation check drops it rather than crediting session-2
        let scan = rx.try_recv().expect("scan should be emitted");
        assert_eq!(scan.entry.barcode, "12");
        assert_eq!(scan.session_id, "session-1");
        assert_eq!(scan.generation, 1);
    }

    #[test]
    fn test_sync_session_without_session_signals_exit() {
        let (worker, shared, _power, _rx) = test_worker();
        let mut session = install_session(&shared, "session-1", 1);
        *shared.session() = None;

        let mut barcode = String::from("partial");
        assert!(!worker.sync_session(&mut barcode, &mut session));
    }

    #[test]
    fn test_idle_step_powers_off_once() {
        let (worker, shared, power, _rx) = test_worker();
        shared.device().usb_port = Some("1-1.2".to_string());

        worker.idle_step();
        worker.idle_step();

        // Second pass sees power already off and does nothing
        assert_eq!(power.ops(), vec!["off:1-1.2"]);
        assert_eq!(shared.device().power_state, PowerState::Off);
    }

    #[test]
    fn test_idle_step_skips_power_off_without_port() {
        let (worker, _shared, power, _rx) = test_worker();
        worker.idle_step();
        assert!(power.ops().is_empty());
    }

    #[test]
    fn test_active_session_without_device_gives_up() {
        let (worker, shared, power, _rx) = test_worker();
        shared.running.store(true, Ordering::Release);
        shared.device().usb_port = Some("1-1.2".to_string());
        install_session(&shared, "session-1", 1);

        // Discovery points at a nonexistent tree, so the device never
        // reappears and the cycle gives up after bounded attempts. The
        // session stays active; the next loop iteration would retry.
        worker.handle_active_session();

        assert_eq!(power.ops(), vec!["on:1-1.2"]);
        assert!(!shared.connected.load(Ordering::Acquire));
        assert!(shared.session_active());
    }
}

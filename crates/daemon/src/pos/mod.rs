//! POS synchronization service
//!
//! Polls the POS for its scan-session state and mirrors the result onto
//! the scanner's session slot: an active remote session activates the
//! scanner, a session ending or any fetch problem deactivates it again.
//! Completed scans arrive over the scan bridge tagged with a session
//! generation; a scan that finishes after its session ended is dropped
//! instead of being attributed to whatever session came next.

mod client;

pub use client::{FetchError, PosClient, SessionApi, SessionState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use common::{PollStatus, PollerStatus, ScanReceiver, TaggedScan};

use crate::config::{PosSettings, SettingsStore};
use crate::scanner::BarcodeScanner;

/// Delay before re-checking when POS settings are missing.
const NOT_CONFIGURED_DELAY: Duration = Duration::from_secs(3);

/// First characters of a session id shown in logs and status lines.
fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

fn active_session_id(session: &SessionState) -> Option<&str> {
    match &session.session_id {
        Some(id) if session.active && !id.is_empty() => Some(id),
        _ => None,
    }
}

/// Session currently mirrored onto the scanner, with the URL/token snapshot
/// taken at activation. Scans are submitted against this snapshot, not
/// against later settings edits.
struct ActivePosSession {
    session_id: String,
    generation: u64,
    url: String,
    token: String,
}

/// The POS polling service.
///
/// `run()` is the worker body; `main` spawns it on the runtime and keeps
/// the handle for status queries and shutdown.
pub struct PosPoller {
    settings: Arc<SettingsStore>,
    scanner: Arc<BarcodeScanner>,
    api: Arc<dyn SessionApi>,
    scans: ScanReceiver,
    active: Mutex<Option<ActivePosSession>>,
    status: Mutex<(PollStatus, String)>,
    running: AtomicBool,
    stop_notify: Notify,
}

impl PosPoller {
    pub fn new(
        settings: Arc<SettingsStore>,
        scanner: Arc<BarcodeScanner>,
        api: Arc<dyn SessionApi>,
        scans: ScanReceiver,
    ) -> Self {
        Self {
            settings,
            scanner,
            api,
            scans,
            active: Mutex::new(None),
            status: Mutex::new((PollStatus::Stopped, String::new())),
            running: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }

    /// Worker body. Polls until `stop()`, then deactivates any scanner
    /// session and marks the status stopped.
    pub async fn run(&self) {
        self.running.store(true, Ordering::Release);
        info!("POS polling service started");

        while self.running.load(Ordering::Acquire) {
            let delay = self.poll_once().await;
            self.wait_cycle(delay).await;
        }

        self.clear_active_session();
        self.set_status(PollStatus::Stopped, "");
        info!("POS polling service stopped");
    }

    /// Request shutdown. The running `run()` future finishes its current
    /// cycle and exits; the caller awaits its task handle.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.stop_notify.notify_one();
    }

    /// Snapshot for the status surface.
    pub fn status(&self) -> PollerStatus {
        let (status, detail) = {
            let guard = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            guard.clone()
        };
        let session_id = self
            .lock_active()
            .as_ref()
            .map(|active| active.session_id.clone());

        PollerStatus {
            status,
            detail,
            session_id,
        }
    }

    /// One polling iteration. Returns how long to wait before the next.
    async fn poll_once(&self) -> Duration {
        let pos = self.settings.pos();

        if pos.url.is_empty() || pos.token.is_empty() {
            self.set_status(PollStatus::NotConfigured, "POS URL or token not configured");
            self.clear_active_session();
            return NOT_CONFIGURED_DELAY;
        }

        // Enforced at use so a hand-edited config cannot zero the interval
        let poll_interval = Duration::from_secs(pos.poll_interval.max(1));

        let session = match self.api.fetch_session(&pos.url, &pos.token).await {
            Ok(session) => session,
            Err(err) => {
                self.set_status(PollStatus::Error, err.to_string());
                self.clear_active_session();
                return poll_interval;
            }
        };

        match active_session_id(&session) {
            Some(session_id) => {
                self.ensure_session(session_id, &pos);
                self.set_status(
                    PollStatus::SessionActive,
                    format!("Session: {}...", short_id(session_id)),
                );
            }
            None => {
                if self.has_active_session() {
                    info!("POS scan session ended");
                    self.clear_active_session();
                }
                self.set_status(PollStatus::Polling, "Waiting for scan request");
            }
        }

        poll_interval
    }

    /// Sleep out the poll delay while draining the scan bridge.
    async fn wait_cycle(&self, delay: Duration) {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return,
                _ = self.stop_notify.notified() => return,
                scan = self.scans.recv() => match scan {
                    Ok(scan) => self.forward_scan(scan).await,
                    Err(_) => break,
                },
            }
        }

        // Scanner side of the bridge is gone; finish the delay without
        // the recv arm.
        tokio::select! {
            _ = &mut sleep => {}
            _ = self.stop_notify.notified() => {}
        }
    }

    /// Activate `session_id` on the scanner unless it is already the
    /// tracked session.
    fn ensure_session(&self, session_id: &str, pos: &PosSettings) {
        let mut active = self.lock_active();
        let unchanged = match active.as_ref() {
            Some(current) => current.session_id == session_id,
            None => false,
        };
        if unchanged {
            return;
        }

        info!("POS scan session active: {}", session_id);
        let generation = self.scanner.activate_session(session_id);
        *active = Some(ActivePosSession {
            session_id: session_id.to_string(),
            generation,
            url: pos.url.clone(),
            token: pos.token.clone(),
        });
    }

    /// Forward one tagged scan, or drop it if its session was superseded.
    async fn forward_scan(&self, scan: TaggedScan) {
        let target = {
            let active = self.lock_active();
            match active.as_ref() {
                Some(current) if current.generation == scan.generation => Some((
                    current.url.clone(),
                    current.token.clone(),
                    current.session_id.clone(),
                )),
                _ => None,
            }
        };

        let (url, token, session_id) = match target {
            Some(target) => target,
            None => {
                debug!(
                    "Dropping scan {} from an ended session (generation {})",
                    scan.entry.barcode, scan.generation
                );
                return;
            }
        };

        // Submission failures are logged by the client; a failed POST never
        // ends the session or stops polling.
        let _ = self
            .api
            .send_barcode(&url, &token, &session_id, &scan.entry)
            .await;
    }

    fn has_active_session(&self) -> bool {
        self.lock_active().is_some()
    }

    fn clear_active_session(&self) -> bool {
        let cleared = self.lock_active().take().is_some();
        if cleared {
            self.scanner.deactivate_session();
        }
        cleared
    }

    fn set_status(&self, status: PollStatus, detail: impl Into<String>) {
        let mut guard = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = (status, detail.into());
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActivePosSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! Async channel bridge between the scanner thread and the Tokio runtime
//!
//! The scanner worker is a blocking OS thread; the POS polling service runs
//! on Tokio. Completed barcode reads cross that boundary here, tagged with
//! the session generation that was active when the read finished so a
//! consumer can discard scans from a superseded session.

use async_channel::{Receiver, Sender, TrySendError, bounded};

use crate::types::ScanEntry;

/// Capacity of the scan bridge. A scanner produces at most a few entries
/// per second, so a backlog this deep only occurs when the consumer is gone.
const SCAN_CHANNEL_CAPACITY: usize = 256;

/// A completed barcode read plus the session it was read under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedScan {
    pub entry: ScanEntry,
    pub session_id: String,
    /// Generation of the session slot at read time. Consumers drop scans
    /// whose generation no longer matches the session they track.
    pub generation: u64,
}

/// Producer half, held by the scanner worker thread.
#[derive(Debug, Clone)]
pub struct ScanSender {
    tx: Sender<TaggedScan>,
}

impl ScanSender {
    /// Send a scan without blocking the worker thread.
    ///
    /// Returns the scan back inside the error when the channel is full or
    /// closed; the caller decides whether dropping it is acceptable.
    pub fn try_send(&self, scan: TaggedScan) -> Result<(), TrySendError<TaggedScan>> {
        self.tx.try_send(scan)
    }
}

/// Consumer half, held by the POS polling service.
#[derive(Debug, Clone)]
pub struct ScanReceiver {
    rx: Receiver<TaggedScan>,
}

impl ScanReceiver {
    /// Receive the next scan from the scanner thread.
    pub async fn recv(&self) -> crate::Result<TaggedScan> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a scan without waiting.
    pub fn try_recv(&self) -> Option<TaggedScan> {
        self.rx.try_recv().ok()
    }
}

/// Create the scan bridge between the scanner thread and Tokio.
///
/// Returns (ScanSender for the worker thread, ScanReceiver for Tokio)
pub fn scan_channel() -> (ScanSender, ScanReceiver) {
    let (tx, rx) = bounded(SCAN_CHANNEL_CAPACITY);
    (ScanSender { tx }, ScanReceiver { rx })
}

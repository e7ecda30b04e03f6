//! Common utilities for scangate
//!
//! This crate provides the functionality shared between the gateway daemon
//! and any surface built on top of it: the scan data model, the observable
//! status types, error handling, logging setup, and the async channel
//! bridge that carries scans from the scanner thread to the Tokio runtime.

pub mod channel;
pub mod error;
pub mod logging;
pub mod types;

pub use channel::{ScanReceiver, ScanSender, TaggedScan, scan_channel};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use types::{PollStatus, PollerStatus, PowerMethod, PowerState, ScanEntry, ScannerStatus};

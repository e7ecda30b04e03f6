//! USB subsystem
//!
//! Sysfs-based device discovery, raw HID report decoding, and USB power
//! control for the scanner. All device I/O here is blocking and runs on the
//! scanner worker thread, never on the Tokio runtime.

pub mod discovery;
pub mod hid;
pub mod power;

pub use discovery::{DeviceType, DiscoveredDevice, KnownDevice, UsbDiscovery};
pub use power::{PowerControl, UsbPowerController};

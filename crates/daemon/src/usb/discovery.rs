//! USB device discovery via sysfs
//!
//! Scans the hidraw class directory for HID devices matching known USB
//! vendor/product IDs and resolves each to its `/dev/hidraw*` path plus the
//! USB topology id needed for bind/unbind power control.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

/// Sysfs directory listing all hidraw class devices.
const SYSFS_HIDRAW: &str = "/sys/class/hidraw";

/// Directory containing the hidraw device nodes.
const DEV_ROOT: &str = "/dev";

/// Bound on upward traversal when resolving a hidraw entry to its USB device.
const MAX_WALK_DEPTH: usize = 10;

/// What a registry entry drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    BarcodeScanner,
}

/// A known USB device identified by vendor and product ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownDevice {
    /// Lowercase hex, as sysfs reports it (e.g. "05f9").
    pub vendor_id: &'static str,
    pub product_id: &'static str,
    pub name: &'static str,
    pub device_type: DeviceType,
}

/// Registry of known barcode scanners and other USB devices.
/// Add new devices here to support auto-detection.
pub const KNOWN_DEVICES: &[KnownDevice] = &[KnownDevice {
    vendor_id: "05f9",
    product_id: "2214",
    name: "Datalogic Touch 65",
    device_type: DeviceType::BarcodeScanner,
}];

/// A discovered USB device with its /dev path and topology id.
///
/// Produced fresh on every scan; carries no identity beyond that scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub hidraw_path: PathBuf,
    pub vendor_id: String,
    pub product_id: String,
    pub name: String,
    pub device_type: DeviceType,
    /// USB topology id (e.g. "1-1.2") for bind/unbind power control.
    pub usb_port: String,
}

/// Sysfs scanner with injectable roots.
///
/// Production uses the real sysfs and /dev; tests point it at a synthetic
/// tree.
#[derive(Debug, Clone)]
pub struct UsbDiscovery {
    sysfs_root: PathBuf,
    dev_root: PathBuf,
    registry: &'static [KnownDevice],
}

impl Default for UsbDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbDiscovery {
    pub fn new() -> Self {
        Self::with_roots(SYSFS_HIDRAW, DEV_ROOT)
    }

    pub fn with_roots(sysfs_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            dev_root: dev_root.into(),
            registry: KNOWN_DEVICES,
        }
    }

    /// Scan all hidraw entries and return those matching known USB IDs.
    ///
    /// An absent sysfs root or unreadable entries yield an empty list, never
    /// an error: no device present is the expected idle state.
    pub fn discover_devices(&self) -> Vec<DiscoveredDevice> {
        let mut discovered = Vec::new();

        let entries = match fs::read_dir(&self.sysfs_root) {
            Ok(entries) => entries,
            Err(_) => {
                debug!(
                    "sysfs hidraw path {} does not exist",
                    self.sysfs_root.display()
                );
                return discovered;
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();

        for hidraw_name in names {
            let (vendor_id, product_id, usb_port) = match self.usb_info_for_hidraw(&hidraw_name) {
                Some(info) => info,
                None => continue,
            };

            let known = match self
                .registry
                .iter()
                .find(|d| d.vendor_id == vendor_id && d.product_id == product_id)
            {
                Some(known) => known,
                None => continue,
            };

            let hidraw_path = self.dev_root.join(&hidraw_name);
            info!(
                "Discovered {} ({}:{}) at {} [usb={}]",
                known.name,
                vendor_id,
                product_id,
                hidraw_path.display(),
                usb_port
            );
            discovered.push(DiscoveredDevice {
                hidraw_path,
                vendor_id,
                product_id,
                name: known.name.to_string(),
                device_type: known.device_type,
                usb_port,
            });
        }

        if discovered.is_empty() {
            debug!("No known USB devices found");
        }

        discovered
    }

    /// Find the first connected barcode scanner, or None.
    pub fn find_barcode_scanner(&self) -> Option<DiscoveredDevice> {
        self.discover_devices()
            .into_iter()
            .find(|d| d.device_type == DeviceType::BarcodeScanner)
    }

    /// Walk the sysfs tree above a hidraw entry to find the USB vendor and
    /// product IDs plus the topology id.
    ///
    /// Returns lowercase hex IDs and the topology id, or None when the entry
    /// has no USB ancestor within the depth bound.
    fn usb_info_for_hidraw(&self, hidraw_name: &str) -> Option<(String, String, String)> {
        let sysfs_path = self.sysfs_root.join(hidraw_name);
        let real_path = fs::canonicalize(&sysfs_path).ok()?;

        let mut current = real_path.as_path();
        for _ in 0..MAX_WALK_DEPTH {
            let vendor = read_sysfs_attr(&current.join("idVendor"));
            let product = read_sysfs_attr(&current.join("idProduct"));
            if let (Some(vendor), Some(product)) = (vendor, product) {
                let usb_port = usb_port_for(current);
                return Some((vendor.to_lowercase(), product.to_lowercase(), usb_port));
            }
            current = current.parent()?;
        }

        None
    }
}

/// Read a single-line sysfs attribute file. Unreadable or empty reads as
/// absent.
fn read_sysfs_attr(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let value = text.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Extract the USB topology id from a sysfs path: the first path component,
/// walking upward, whose name matches the bus-port pattern. Falls back to
/// the starting directory's name if none matches.
fn usb_port_for(found: &Path) -> String {
    let mut current = found;
    for _ in 0..MAX_WALK_DEPTH {
        if let Some(name) = current.file_name().and_then(|n| n.to_str()) {
            if is_usb_port_id(name) {
                return name.to_string();
            }
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }

    found
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Match USB device directory names like "1-1", "1-1.2", "3-1.4": digits,
/// a dash, then digits and dots.
fn is_usb_port_id(name: &str) -> bool {
    match name.split_once('-') {
        Some((bus, ports)) => {
            !bus.is_empty()
                && bus.bytes().all(|b| b.is_ascii_digit())
                && !ports.is_empty()
                && ports.bytes().all(|b| b.is_ascii_digit() || b == b'.')
        }
        None => false,
    }
}

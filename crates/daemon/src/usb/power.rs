//! USB power control
//!
//! Two strategies:
//! - bind/unbind: detaches the device driver via sysfs. Per-device and safe
//!   for neighboring USB devices; the device stays powered but disappears
//!   from the OS.
//! - uhubctl: real power cut via hub port switching. On the Raspberry Pi 5
//!   this switches ALL ports at once (hardware limitation).

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use common::PowerMethod;
use nix::errno::Errno;
use tracing::{debug, error, info, warn};

use crate::config::SettingsStore;

/// Sysfs driver directory holding the bind/unbind control files.
const SYSFS_USB_DRIVER: &str = "/sys/bus/usb/drivers/usb";

/// Raspberry Pi 5 requires commands on both bus 1 and 3.
const UHUBCTL_LOCATIONS: &[&str] = &["1", "3"];

/// Upper bound on a single uhubctl invocation.
const UHUBCTL_TIMEOUT: Duration = Duration::from_secs(10);

/// Power switching seam for the scanner worker.
///
/// Operations report success as a bool and log their own failures; power
/// faults degrade the session cycle but never abort it.
pub trait PowerControl: Send + Sync {
    fn power_on(&self, usb_port: Option<&str>) -> bool;
    fn power_off(&self, usb_port: Option<&str>) -> bool;
}

/// Controls USB device power via bind/unbind or uhubctl.
///
/// The method is read from the settings store on every call, so a settings
/// change takes effect on the next power transition without a restart.
pub struct UsbPowerController {
    settings: Arc<SettingsStore>,
    driver_root: PathBuf,
    uhubctl_available: OnceLock<bool>,
}

impl UsbPowerController {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self::with_driver_root(settings, SYSFS_USB_DRIVER)
    }

    pub fn with_driver_root(settings: Arc<SettingsStore>, driver_root: impl Into<PathBuf>) -> Self {
        info!(
            "USB power controller initialized (method={})",
            settings.usb_power().method
        );
        Self {
            settings,
            driver_root: driver_root.into(),
            uhubctl_available: OnceLock::new(),
        }
    }

    pub fn method(&self) -> PowerMethod {
        self.settings.usb_power().method
    }

    /// Check once whether uhubctl is installed; the probe result is cached.
    pub fn is_uhubctl_available(&self) -> bool {
        *self.uhubctl_available.get_or_init(|| match which::which("uhubctl") {
            Ok(path) => {
                info!("uhubctl found at {}", path.display());
                true
            }
            Err(_) => {
                info!("uhubctl not found on this system");
                false
            }
        })
    }

    fn set_power(&self, on: bool, usb_port: Option<&str>) -> bool {
        match self.method() {
            PowerMethod::None => true,
            PowerMethod::Uhubctl => self.uhubctl_power(on),
            PowerMethod::BindUnbind => match usb_port {
                Some(port) => {
                    if on {
                        self.bind(port)
                    } else {
                        self.unbind(port)
                    }
                }
                None => {
                    warn!(
                        "Cannot power {}: no USB port known",
                        if on { "on" } else { "off" }
                    );
                    false
                }
            },
        }
    }

    /// Re-attach a USB device to the kernel driver.
    fn bind(&self, usb_port: &str) -> bool {
        match fs::write(self.driver_root.join("bind"), usb_port) {
            Ok(()) => {
                info!("USB bind: {}", usb_port);
                true
            }
            Err(err) if is_device_gone(&err) => {
                debug!("USB device {} already bound", usb_port);
                true
            }
            Err(err) => {
                error!("USB bind failed for {}: {}", usb_port, err);
                false
            }
        }
    }

    /// Detach a USB device from the kernel driver.
    fn unbind(&self, usb_port: &str) -> bool {
        match fs::write(self.driver_root.join("unbind"), usb_port) {
            Ok(()) => {
                info!("USB unbind: {}", usb_port);
                true
            }
            Err(err) if is_device_gone(&err) => {
                debug!("USB device {} already unbound", usb_port);
                true
            }
            Err(err) => {
                error!("USB unbind failed for {}: {}", usb_port, err);
                false
            }
        }
    }

    /// Toggle USB power using uhubctl (affects ALL ports on RPi5).
    fn uhubctl_power(&self, on: bool) -> bool {
        if !self.is_uhubctl_available() {
            error!("uhubctl not available, cannot control USB power");
            return false;
        }

        let action = if on { "1" } else { "0" };
        let action_name = if on { "on" } else { "off" };
        let mut success = true;

        for location in UHUBCTL_LOCATIONS {
            let mut cmd = Command::new("uhubctl");
            cmd.args(["-l", location, "-a", action]);

            match run_with_timeout(cmd, UHUBCTL_TIMEOUT) {
                Ok(output) if output.status.success() => {
                    info!("uhubctl: USB power {} (location {})", action_name, location);
                }
                Ok(output) => {
                    warn!(
                        "uhubctl -l {} -a {} failed (rc={}): {}",
                        location,
                        action,
                        output.status.code().unwrap_or(-1),
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                    success = false;
                }
                Err(err) => {
                    error!("uhubctl execution failed: {}", err);
                    success = false;
                }
            }
        }

        success
    }

    #[cfg(test)]
    fn with_uhubctl_probed(self, available: bool) -> Self {
        let _ = self.uhubctl_available.set(available);
        self
    }
}

impl PowerControl for UsbPowerController {
    fn power_on(&self, usb_port: Option<&str>) -> bool {
        self.set_power(true, usb_port)
    }

    fn power_off(&self, usb_port: Option<&str>) -> bool {
        self.set_power(false, usb_port)
    }
}

/// ENODEV from the driver control files means the device is already in the
/// requested state, so the operation is a success.
fn is_device_gone(err: &io::Error) -> bool {
    err.raw_os_error() == Some(Errno::ENODEV as i32)
}

/// Run a command, killing it if it outlives the timeout. Nothing drains the
/// pipes until the child exits, so its output must stay below the pipe
/// buffer; uhubctl's does.
fn run_with_timeout(mut cmd: Command, timeout: Duration) -> io::Result<Output> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let deadline = Instant::now() + timeout;

    loop {
        if child.try_wait()?.is_some() {
            return child.wait_with_output();
        }
        if Instant::now() >= deadline {
            child.kill()?;
            let _ = child.wait();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("command timed out after {:?}", timeout),
            ));
        }
        thread::sleep(Duration::from_millis(50));
    }
}

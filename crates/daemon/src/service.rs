//! Systemd service integration
//!
//! sd-notify protocol support for a Type=notify unit: readiness and
//! shutdown notifications, live status text for `systemctl status`, and
//! the watchdog keepalive. Every call is a no-op when the daemon is not
//! running under systemd.

use std::env;
use std::os::unix::net::UnixDatagram;

use anyhow::{Context, Result};
use tracing::{debug, error, info};

/// Send one state line to the socket named by `NOTIFY_SOCKET`.
///
/// Returns false (without error) when the variable is unset.
fn notify(state: &str) -> Result<bool> {
    let socket_path = match env::var("NOTIFY_SOCKET") {
        Ok(path) => path,
        Err(_) => return Ok(false),
    };

    let socket = UnixDatagram::unbound().context("Failed to create notify socket")?;
    socket
        .send_to(state.as_bytes(), &socket_path)
        .context("Failed to send notification to systemd")?;
    Ok(true)
}

/// Notify systemd that startup is complete.
///
/// Call once the workers are wired and running; until then systemd holds
/// dependent units back.
pub fn notify_ready() -> Result<()> {
    if notify("READY=1")? {
        info!("Notified systemd: service ready");
    } else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
    }
    Ok(())
}

/// Notify systemd that shutdown has begun.
pub fn notify_stopping() -> Result<()> {
    if notify("STOPPING=1")? {
        info!("Notified systemd: service stopping");
    } else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
    }
    Ok(())
}

/// Publish a one-line status visible in `systemctl status`.
pub fn notify_status(status: &str) -> Result<()> {
    if notify(&format!("STATUS={}", status))? {
        debug!("Notified systemd: status = {}", status);
    }
    Ok(())
}

/// Send one watchdog keepalive. Silently does nothing without systemd.
pub fn notify_watchdog() -> Result<()> {
    notify("WATCHDOG=1")?;
    Ok(())
}

/// Watchdog timeout configured by systemd, in microseconds.
pub fn get_watchdog_timeout() -> Option<u64> {
    env::var("WATCHDOG_USEC").ok().and_then(|s| s.parse().ok())
}

/// Whether the process runs under systemd with Type=notify.
pub fn is_systemd() -> bool {
    env::var("NOTIFY_SOCKET").is_ok()
}

/// Spawn the watchdog keepalive task.
///
/// Sends WATCHDOG=1 at half the configured watchdog interval. When the
/// watchdog is not enabled the returned task completes immediately. Abort
/// the handle during shutdown.
pub fn spawn_watchdog_task() -> tokio::task::JoinHandle<()> {
    let timeout_usec = match get_watchdog_timeout() {
        Some(timeout_usec) => timeout_usec,
        None => {
            debug!("Systemd watchdog not enabled, skipping watchdog task");
            return tokio::spawn(async {});
        }
    };

    let interval_secs = (timeout_usec / 1_000_000) / 2;
    let interval = std::time::Duration::from_secs(interval_secs.max(1));
    info!(
        "Systemd watchdog enabled, keepalive every {}s (timeout {}s)",
        interval.as_secs(),
        timeout_usec / 1_000_000
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = notify_watchdog() {
                // Keep sending despite errors
                error!("Failed to send watchdog keepalive: {:#}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_systemd_without_socket() {
        unsafe {
            env::remove_var("NOTIFY_SOCKET");
        }
        assert!(!is_systemd());
    }

    #[test]
    fn test_notify_functions_without_socket() {
        unsafe {
            env::remove_var("NOTIFY_SOCKET");
        }

        assert!(notify_ready().is_ok());
        assert!(notify_stopping().is_ok());
        assert!(notify_watchdog().is_ok());
        assert!(notify_status("polling").is_ok());
    }

    #[test]
    fn test_get_watchdog_timeout() {
        unsafe {
            env::remove_var("WATCHDOG_USEC");
        }
        assert!(get_watchdog_timeout().is_none());

        unsafe {
            env::set_var("WATCHDOG_USEC", "30000000");
        }
        assert_eq!(get_watchdog_timeout(), Some(30_000_000));

        unsafe {
            env::set_var("WATCHDOG_USEC", "not-a-number");
        }
        assert!(get_watchdog_timeout().is_none());

        unsafe {
            env::remove_var("WATCHDOG_USEC");
        }
    }
}

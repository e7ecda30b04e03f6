//! HID keyboard report decoding and timed reads
//!
//! A scanner in HID keyboard mode emits 8-byte boot-protocol reports:
//! modifier byte, reserved byte, then six key slots. Barcode characters
//! arrive one report each and the Enter key terminates the code. Reads go
//! through poll(2) so callers can check shutdown flags between reports.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::trace;

/// HID boot keyboard report size in bytes.
pub const HID_REPORT_SIZE: usize = 8;

/// Enter key scancode, terminates a barcode.
pub const SCANCODE_ENTER: u8 = 0x28;

/// Shift modifier bitmask (left shift = bit 1, right shift = bit 5).
pub const SHIFT_MASK: u8 = 0x22;

/// Outcome of a single timed report read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportRead {
    /// A complete 8-byte report arrived.
    Report([u8; HID_REPORT_SIZE]),
    /// No data within the timeout.
    TimedOut,
    /// Empty or short read: the device node is gone.
    Disconnected,
}

/// Map a USB HID keyboard scancode to its character.
///
/// Reference: USB HID Usage Tables, Keyboard/Keypad page. Unmapped
/// scancodes yield None.
pub fn decode_scancode(scancode: u8, shifted: bool) -> Option<char> {
    let (plain, upper) = match scancode {
        0x04 => ('a', 'A'),
        0x05 => ('b', 'B'),
        0x06 => ('c', 'C'),
        0x07 => ('d', 'D'),
        0x08 => ('e', 'E'),
        0x09 => ('f', 'F'),
        0x0a => ('g', 'G'),
        0x0b => ('h', 'H'),
        0x0c => ('i', 'I'),
        0x0d => ('j', 'J'),
        0x0e => ('k', 'K'),
        0x0f => ('l', 'L'),
        0x10 => ('m', 'M'),
        0x11 => ('n', 'N'),
        0x12 => ('o', 'O'),
        0x13 => ('p', 'P'),
        0x14 => ('q', 'Q'),
        0x15 => ('r', 'R'),
        0x16 => ('s', 'S'),
        0x17 => ('t', 'T'),
        0x18 => ('u', 'U'),
        0x19 => ('v', 'V'),
        0x1a => ('w', 'W'),
        0x1b => ('x', 'X'),
        0x1c => ('y', 'Y'),
        0x1d => ('z', 'Z'),
        0x1e => ('1', '!'),
        0x1f => ('2', '@'),
        0x20 => ('3', '#'),
        0x21 => ('4', '$'),
        0x22 => ('5', '%'),
        0x23 => ('6', '^'),
        0x24 => ('7', '&'),
        0x25 => ('8', '*'),
        0x26 => ('9', '('),
        0x27 => ('0', ')'),
        0x2c => (' ', ' '),
        0x2d => ('-', '_'),
        0x2e => ('=', '+'),
        0x2f => ('[', '{'),
        0x30 => (']', '}'),
        0x31 => ('\\', '|'),
        0x33 => (';', ':'),
        0x34 => ('\'', '"'),
        0x35 => ('`', '~'),
        0x36 => (',', '<'),
        0x37 => ('.', '>'),
        0x38 => ('/', '?'),
        _ => return None,
    };
    Some(if shifted { upper } else { plain })
}

/// Decode a single HID report into a character.
///
/// Key releases (keycode 0), the Enter key, and unmapped scancodes decode
/// to None. Callers detect Enter themselves via [`SCANCODE_ENTER`].
pub fn decode_report(data: &[u8]) -> Option<char> {
    if data.len() < HID_REPORT_SIZE {
        return None;
    }

    let modifier = data[0];
    let scancode = data[2];

    if scancode == 0 || scancode == SCANCODE_ENTER {
        return None;
    }

    decode_scancode(scancode, modifier & SHIFT_MASK != 0)
}

/// Read a single HID report, waiting at most `timeout` for data.
pub fn read_report_timeout(device: &mut File, timeout: Duration) -> io::Result<ReportRead> {
    if !wait_readable(device, to_poll_timeout(timeout))? {
        return Ok(ReportRead::TimedOut);
    }
    read_ready_report(device)
}

/// Discard all buffered reports without blocking.
///
/// Called when a scan session starts so input from before the session is
/// never attributed to it. Returns the number of reports discarded.
pub fn flush_input(device: &mut File) -> io::Result<usize> {
    let mut flushed = 0;

    while wait_readable(device, PollTimeout::ZERO)? {
        match read_ready_report(device)? {
            ReportRead::Report(_) => flushed += 1,
            _ => break,
        }
    }

    if flushed > 0 {
        trace!("Flushed {} stale HID reports", flushed);
    }
    Ok(flushed)
}

fn read_ready_report(device: &mut File) -> io::Result<ReportRead> {
    let mut buf = [0u8; HID_REPORT_SIZE];
    let n = loop {
        match device.read(&mut buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    };

    if n < HID_REPORT_SIZE {
        return Ok(ReportRead::Disconnected);
    }
    Ok(ReportRead::Report(buf))
}

/// Wait until the device is readable or the timeout elapses. EINTR reads
/// as not ready; callers poll in a loop anyway.
fn wait_readable(device: &File, timeout: PollTimeout) -> io::Result<bool> {
    let mut fds = [PollFd::new(device.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, timeout) {
        Ok(n) => Ok(n > 0),
        Err(Errno::EINTR) => Ok(false),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

/// Poll timeouts are millisecond-precision; durations beyond the u16 range
/// saturate to the maximum finite timeout.
fn to_poll_timeout(timeout: Duration) -> PollTimeout {
    u16::try_from(timeout.as_millis())
        .map(PollTimeout::from)
        .unwrap_or(PollTimeout::MAX)
}


/// Property-based tests using proptest
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Property: decoding never panics, whatever the report bytes
        #[test]
        fn prop_decode_total(data in proptest::collection::vec(any::<u8>(), 0..=16)) {
            let _ = decode_report(&data);
        }

        /// Property: shift only ever changes the character, never whether
        /// a scancode maps at all
        #[test]
        fn prop_shift_preserves_mapping(scancode in any::<u8>()) {
            prop_assert_eq!(
                decode_scancode(scancode, false).is_some(),
                decode_scancode(scancode, true).is_some()
            );
        }

        /// Property: letter scancodes decode to ASCII letters in both maps
        #[test]
        fn prop_letters_decode_to_letters(scancode in 0x04u8..=0x1du8) {
            let plain = decode_scancode(scancode, false).unwrap();
            let upper = decode_scancode(scancode, true).unwrap();
            prop_assert!(plain.is_ascii_lowercase());
            prop_assert_eq!(plain.to_ascii_uppercase(), upper);
        }
    }
}

//! Ring-buffer logging that works in a `no_std` environment.
//!
//! Messages land in a 64 KiB memory ring (overwriting the oldest data when
//! full) so an external agent can pull logs without hypervisor cooperation,
//! and are mirrored to the legacy COM1 UART for early bring-up. Levels
//! follow the usual severity ladder; the compile-time `LOG_LEVEL` gates
//! what is formatted at all.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};

pub const LOG_LEVEL_FATAL: u8 = 0;
pub const LOG_LEVEL_ERR: u8 = 1;
pub const LOG_LEVEL_WARN: u8 = 2;
pub const LOG_LEVEL_INFO: u8 = 3;
pub const LOG_LEVEL_DBG: u8 = 4;

/// Messages above this level are dropped before formatting.
pub const LOG_LEVEL: u8 = LOG_LEVEL_INFO;

const LOG_BUF_SIZE: usize = 64 * 1024;

struct LogRing(core::cell::UnsafeCell<[u8; LOG_BUF_SIZE]>);
// Writes are racy by design: the ring is diagnostics, the cursor is atomic
// and every slot write is a single byte.
unsafe impl Sync for LogRing {}

static LOG_BUFFER: LogRing = LogRing(core::cell::UnsafeCell::new([0; LOG_BUF_SIZE]));
static WRITE_POS: AtomicUsize = AtomicUsize::new(0);

#[cfg(target_arch = "x86_64")]
const UART_BASE: u16 = 0x3F8;

static SERIAL_ENABLED: core::sync::atomic::AtomicBool =
    core::sync::atomic::AtomicBool::new(false);

/// Turn on the COM1 mirror once the platform console is known usable.
pub fn enable_serial() {
    SERIAL_ENABLED.store(true, Ordering::Release);
}

#[inline(always)]
fn uart_write_byte(byte: u8) {
    if SERIAL_ENABLED.load(Ordering::Acquire) {
        let mut port = x86_64::instructions::port::Port::<u8>::new(UART_BASE);
        // SAFETY: COM1 data port write, no memory effects.
        unsafe { port.write(byte) };
    }
}

#[inline]
fn write_byte(b: u8) {
    let pos = WRITE_POS.fetch_add(1, Ordering::Relaxed) % LOG_BUF_SIZE;
    // SAFETY: single-byte store into the diagnostics ring; races only cost
    // interleaved log text.
    unsafe { (*LOG_BUFFER.0.get())[pos] = b };
    uart_write_byte(b);
}

pub struct RingWriter;

impl Write for RingWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            write_byte(b);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn do_log(level: u8, prefix: &str, args: fmt::Arguments<'_>) {
    if level > LOG_LEVEL {
        return;
    }
    let mut w = RingWriter;
    let _ = w.write_str("[");
    let _ = w.write_str(prefix);
    let _ = w.write_str("] ");
    let _ = w.write_fmt(args);
    let _ = w.write_str("\r\n");
}

#[macro_export]
macro_rules! pr_fatal {
    ($($arg:tt)*) => {
        $crate::log::do_log($crate::log::LOG_LEVEL_FATAL, "FATAL", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! pr_err {
    ($($arg:tt)*) => {
        $crate::log::do_log($crate::log::LOG_LEVEL_ERR, "ERROR", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! pr_warn {
    ($($arg:tt)*) => {
        $crate::log::do_log($crate::log::LOG_LEVEL_WARN, "WARN", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! pr_info {
    ($($arg:tt)*) => {
        $crate::log::do_log($crate::log::LOG_LEVEL_INFO, "INFO", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! pr_dbg {
    ($($arg:tt)*) => {
        $crate::log::do_log($crate::log::LOG_LEVEL_DBG, "DEBUG", format_args!($($arg)*))
    };
}

/// Copy out the newest `out.len()` bytes of the ring, oldest first.
pub fn snapshot(out: &mut [u8]) -> usize {
    let end = WRITE_POS.load(Ordering::Relaxed);
    let len = out.len().min(end.min(LOG_BUF_SIZE));
    let start = end - len;
    for (i, slot) in out.iter_mut().take(len).enumerate() {
        let pos = (start + i) % LOG_BUF_SIZE;
        // SAFETY: byte read from the diagnostics ring.
        *slot = unsafe { (*LOG_BUFFER.0.get())[pos] };
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_reach_the_ring() {
        pr_err!("vm{} bad {}", 1, "write");
        let mut buf = [0u8; 128];
        let n = snapshot(&mut buf);
        let text = core::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.contains("[ERROR] vm1 bad write"));
    }

    #[test]
    fn debug_is_compiled_out_at_info_level() {
        let before = WRITE_POS.load(Ordering::Relaxed);
        pr_dbg!("invisible");
        assert_eq!(WRITE_POS.load(Ordering::Relaxed), before);
    }
}

//! Last-resort fault reporting.
//!
//! CPU-level faults (SIGSEGV and friends) and Rust panics both end the
//! process with the same distinctive exit code after a minimal report. The
//! signal handler only uses async-signal-safe calls: a fixed stack buffer is
//! formatted by hand and pushed out with `write(2)`.

use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, Ordering};

/// Exit status for unrecoverable faults (reads as 255 to the parent).
pub const FATAL_EXIT_CODE: i32 = -1;

static INSTALLED: AtomicBool = AtomicBool::new(false);

const FAULT_SIGNALS: [c_int; 4] = [libc::SIGSEGV, libc::SIGBUS, libc::SIGILL, libc::SIGFPE];

/// Register the fault handler and panic hook. Safe to call once; later calls
/// are no-ops.
pub fn install() {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }

    let handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut libc::c_void) = fault_handler;
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        for sig in FAULT_SIGNALS {
            libc::sigaction(sig, &action, std::ptr::null_mut());
        }
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("\nFatal error - {info}");
        std::process::exit(FATAL_EXIT_CODE);
    }));
}

extern "C" fn fault_handler(sig: c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let mut msg = Buf::new();
    msg.push_str("\nFatal error - unhandled fault.\nSignal ");
    msg.push_dec(sig as u64);
    msg.push_str(" at address 0x");
    let addr = if info.is_null() {
        0
    } else {
        unsafe { (*info).si_addr() as usize }
    };
    msg.push_hex(addr as u64);
    msg.push_str("\n");

    unsafe {
        libc::write(libc::STDERR_FILENO, msg.bytes.as_ptr().cast(), msg.len);
        libc::_exit(FATAL_EXIT_CODE);
    }
}

/// Tiny fixed-capacity formatter usable inside a signal handler.
struct Buf {
    bytes: [u8; 128],
    len: usize,
}

impl Buf {
    fn new() -> Self {
        Self {
            bytes: [0; 128],
            len: 0,
        }
    }

    fn push_byte(&mut self, b: u8) {
        if self.len < self.bytes.len() {
            self.bytes[self.len] = b;
            self.len += 1;
        }
    }

    fn push_str(&mut self, s: &str) {
        for &b in s.as_bytes() {
            self.push_byte(b);
        }
    }

    fn push_dec(&mut self, mut value: u64) {
        let mut digits = [0u8; 20];
        let mut n = 0;
        loop {
            digits[n] = b'0' + (value % 10) as u8;
            value /= 10;
            n += 1;
            if value == 0 {
                break;
            }
        }
        while n > 0 {
            n -= 1;
            self.push_byte(digits[n]);
        }
    }

    fn push_hex(&mut self, value: u64) {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut started = false;
        for shift in (0..16).rev() {
            let nibble = ((value >> (shift * 4)) & 0xF) as usize;
            if nibble != 0 || started || shift == 0 {
                started = true;
                self.push_byte(HEX[nibble]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatter_renders_numbers() {
        let mut buf = Buf::new();
        buf.push_str("sig ");
        buf.push_dec(11);
        buf.push_str(" @ 0x");
        buf.push_hex(0xdead_beef);
        assert_eq!(&buf.bytes[..buf.len], b"sig 11 @ 0xdeadbeef");

        let mut zero = Buf::new();
        zero.push_dec(0);
        zero.push_hex(0);
        assert_eq!(&zero.bytes[..zero.len], b"00");
    }
}

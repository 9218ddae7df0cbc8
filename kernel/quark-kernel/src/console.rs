//! Console I/O and the cooked-mode line discipline.
//!
//! Output goes to an externally registered `tty_putchar`; input comes
//! from an externally registered keyboard source (the framebuffer
//! console and PS/2 driver live outside this tree). Reads from the
//! stdin descriptor are line-buffered: characters are echoed and
//! edited until Enter completes the line, backspace erases, Ctrl-C
//! interrupts the read, and Ctrl-D on an empty line signals EOF.

extern crate alloc;

use alloc::collections::VecDeque;
use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

use quark_core::sync::SpinLock;
use quark_fs::FsError;

/// Maximum length of one input line.
const LINE_MAX: usize = 256;

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const DEL: u8 = 0x7F;

// ---------------------------------------------------------------------------
// Registered collaborators
// ---------------------------------------------------------------------------

fn null_putchar(_c: u8) {}

fn null_has_key() -> bool {
    false
}

fn null_getchar() -> u8 {
    0
}

static TTY_PUTCHAR: AtomicPtr<()> = AtomicPtr::new(null_putchar as *mut ());
static KBD_HAS_KEY: AtomicPtr<()> = AtomicPtr::new(null_has_key as *mut ());
static KBD_GETCHAR: AtomicPtr<()> = AtomicPtr::new(null_getchar as *mut ());

/// Registers the console output sink.
pub fn set_tty_putchar(f: fn(u8)) {
    TTY_PUTCHAR.store(f as *mut (), Ordering::Release);
}

/// Registers the keyboard source (`has_key`, `getchar`).
pub fn set_keyboard_source(has_key: fn() -> bool, getchar: fn() -> u8) {
    KBD_HAS_KEY.store(has_key as *mut (), Ordering::Release);
    KBD_GETCHAR.store(getchar as *mut (), Ordering::Release);
}

fn tty_putchar(c: u8) {
    let ptr = TTY_PUTCHAR.load(Ordering::Acquire);
    // SAFETY: Only `fn(u8)` values are ever stored.
    let f: fn(u8) = unsafe { core::mem::transmute(ptr) };
    f(c);
}

fn keyboard_has_key() -> bool {
    let ptr = KBD_HAS_KEY.load(Ordering::Acquire);
    // SAFETY: Only `fn() -> bool` values are ever stored.
    let f: fn() -> bool = unsafe { core::mem::transmute(ptr) };
    f()
}

fn keyboard_getchar() -> u8 {
    let ptr = KBD_GETCHAR.load(Ordering::Acquire);
    // SAFETY: Only `fn() -> u8` values are ever stored.
    let f: fn() -> u8 = unsafe { core::mem::transmute(ptr) };
    f()
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Writes raw bytes to the console.
pub fn write_bytes(bytes: &[u8]) {
    for &b in bytes {
        tty_putchar(b);
    }
}

struct ConsoleWriter;

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Writes formatted text to the console.
pub fn write_fmt(args: fmt::Arguments<'_>) {
    use fmt::Write;
    let _ = ConsoleWriter.write_fmt(args);
}

// ---------------------------------------------------------------------------
// Line discipline
// ---------------------------------------------------------------------------

struct LineState {
    /// Completed input waiting to be consumed by reads.
    ready: VecDeque<u8>,
    /// The line currently being edited.
    line: [u8; LINE_MAX],
    line_len: usize,
    /// Ctrl-D completed an empty line: the next read returns 0.
    eof_pending: bool,
}

static LINE: SpinLock<LineState> = SpinLock::new(LineState {
    ready: VecDeque::new(),
    line: [0; LINE_MAX],
    line_len: 0,
    eof_pending: false,
});

/// Outcome of feeding one keystroke into the discipline.
enum Keystroke {
    /// Keep collecting.
    Pending,
    /// A full line (or EOF) is available.
    Complete,
    /// Ctrl-C: abort the read.
    Interrupted,
}

fn feed(state: &mut LineState, c: u8) -> Keystroke {
    match c {
        b'\r' | b'\n' => {
            for i in 0..state.line_len {
                let byte = state.line[i];
                state.ready.push_back(byte);
            }
            state.ready.push_back(b'\n');
            state.line_len = 0;
            tty_putchar(b'\n');
            Keystroke::Complete
        }
        BACKSPACE | DEL => {
            if state.line_len > 0 {
                state.line_len -= 1;
                write_bytes(b"\x08 \x08");
            }
            Keystroke::Pending
        }
        CTRL_C => {
            state.line_len = 0;
            write_bytes(b"^C\n");
            Keystroke::Interrupted
        }
        CTRL_D => {
            if state.line_len == 0 {
                state.eof_pending = true;
                Keystroke::Complete
            } else {
                Keystroke::Pending
            }
        }
        c if (0x20..0x7F).contains(&c) || c == b'\t' => {
            if state.line_len < LINE_MAX {
                let len = state.line_len;
                state.line[len] = c;
                state.line_len += 1;
                tty_putchar(c);
            }
            Keystroke::Pending
        }
        _ => Keystroke::Pending,
    }
}

/// Blocking console read for descriptors 0/1/2 without a vnode.
///
/// Returns buffered bytes as soon as a completed line is available;
/// 0 means EOF (Ctrl-D on an empty line); `Interrupted` is Ctrl-C.
pub fn read_line(buf: &mut [u8]) -> Result<usize, FsError> {
    if buf.is_empty() {
        return Ok(0);
    }

    loop {
        {
            let mut state = LINE.lock();

            // Serve leftovers from an earlier line first.
            if !state.ready.is_empty() {
                let mut n = 0;
                while n < buf.len() {
                    match state.ready.pop_front() {
                        Some(b) => {
                            buf[n] = b;
                            n += 1;
                        }
                        None => break,
                    }
                }
                return Ok(n);
            }
            if state.eof_pending {
                state.eof_pending = false;
                return Ok(0);
            }

            // Drain the keyboard.
            while keyboard_has_key() {
                let c = keyboard_getchar();
                match feed(&mut state, c) {
                    Keystroke::Pending => {}
                    Keystroke::Complete => break,
                    Keystroke::Interrupted => return Err(FsError::Interrupted),
                }
            }

            if !state.ready.is_empty() || state.eof_pending {
                continue;
            }
        }

        // Nothing buffered: let other threads run, then park until the
        // next interrupt.
        crate::sched::yield_now();
        crate::arch::x86_64::interrupts::enable_and_hlt();
    }
}

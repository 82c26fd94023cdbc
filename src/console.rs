//! Formatted console output (`print!`/`println!`) and the panic handler.
//!
//! Grounded on `kernel-rs/src/console.rs` + `kernel-rs/src/printer.rs`: a
//! `Writer` that implements `core::fmt::Write` over a character sink,
//! wrapped in a spinlock so concurrent `print!`s from different threads
//! don't interleave mid-line.

use core::fmt;

use crate::hal::CharSink;
use crate::lock::Spinlock;

/// The attached character sink. A real boot replaces this via
/// [`set_sink`] with a UART driver; until then, output is silently
/// discarded (matching the teacher's pre-`consoleinit` behavior).
static SINK: Spinlock<Option<&'static mut dyn CharSink>> = Spinlock::new_named("console", None);

/// Attach the console's backing character sink. Call once during boot,
/// before the first `print!`.
pub fn set_sink(sink: &'static mut dyn CharSink) {
    *SINK.lock() = Some(sink);
}

struct Writer;

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(sink) = SINK.lock().as_mut() {
            for b in s.bytes() {
                sink.put_char(b);
            }
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;
    let _ = Writer.write_fmt(args);
}

/// Prints to the console, no trailing newline.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

/// Prints to the console with a trailing newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    println!("kernel panic: {}", info);
    loop {
        core::hint::spin_loop();
    }
}

//! Console-backed log sinks.

use core::fmt;

use quark_core::log::LogLevel;

use crate::console;

fn console_print(args: fmt::Arguments<'_>) {
    console::write_fmt(args);
}

fn console_log(level: LogLevel, args: fmt::Arguments<'_>) {
    let ms = crate::time::uptime_ms();
    console::write_fmt(format_args!(
        "[{:5}.{:03}] {} {}\n",
        ms / 1000,
        ms % 1000,
        level.name(),
        args
    ));
}

/// Routes the logging facade to the console.
pub fn init() {
    quark_core::log::set_print_fn(console_print);
    quark_core::log::set_log_fn(console_log);
}

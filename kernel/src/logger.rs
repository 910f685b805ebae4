//! Kernel logger
//!
//! Backend for the `log` crate facade: records are formatted onto the
//! COM1 serial port. Only x86_64 bare-metal builds carry the backend;
//! host builds (unit tests) leave the facade uninstalled and the macros
//! compile to no-ops.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod serial {
    use lazy_static::lazy_static;
    use spin::Mutex;
    use uart_16550::SerialPort;

    /// COM1 base I/O port.
    const COM1: u16 = 0x3F8;

    lazy_static! {
        pub static ref SERIAL1: Mutex<SerialPort> = {
            // SAFETY: COM1 is the standard 16550 register block; nothing
            // else in the kernel drives these ports.
            let mut port = unsafe { SerialPort::new(COM1) };
            port.init();
            Mutex::new(port)
        };
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
struct SerialLogger;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        use core::fmt::Write;

        // Interrupt handlers log too; keep them out while the port lock
        // is held.
        x86_64::instructions::interrupts::without_interrupts(|| {
            let mut port = serial::SERIAL1.lock();
            let _ = writeln!(port, "[{:5}] {}", record.level(), record.args());
        });
    }

    fn flush(&self) {}
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger. Reinstalling is a no-op.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init(level: log::LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// No logging backend on this target.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn init(_level: log::LevelFilter) {}

//! Serial port logger.
//!
//! Every line is tagged with the APIC id of the logical processor that emitted it, so output
//! from concurrently running exit handlers can be told apart.

use {
    crate::sync::{OnceInit, SpinLock},
    core::fmt::{self, Write},
};

/// UART register offsets
const UART_OFFSET_DATA: u16 = 0x0;
const UART_OFFSET_INTERRUPT_ENABLE: u16 = 0x1;
const UART_OFFSET_FIFO_CONTROL: u16 = 0x2;
const UART_OFFSET_LINE_CONTROL: u16 = 0x3;
const UART_OFFSET_MODEM_CONTROL: u16 = 0x4;
const UART_OFFSET_LINE_STATUS: u16 = 0x5;

/// Line status: transmitter holding register empty.
const UART_LINE_STATUS_THRE: u8 = 0x20;

static LOGGER: OnceInit<SerialLogger> = OnceInit::new();

/// Serial ports supported by the logger.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SerialPort {
    /// COM1 (0x3F8)
    COM1 = 0x3F8,
    /// COM2 (0x2F8)
    COM2 = 0x2F8,
}

/// Installs the serial logger as the global `log` logger.
///
/// Idempotent: later calls only change the maximum level. The port chosen by the first call
/// stays in use.
pub fn init(port: SerialPort, level: log::LevelFilter) {
    let mut installed = false;

    let logger = LOGGER.get_or_init(|| {
        installed = true;
        SerialLogger::new(port)
    });

    if installed {
        // Another logger may already be registered; logging must never take the hypervisor down.
        let _ = log::set_logger(logger);
    }

    log::set_max_level(level);
}

/// Writes one log line: `lp-<apic id> <LEVEL>: <message>`.
pub fn format_record(out: &mut impl Write, apic_id: u32, level: log::Level, args: &fmt::Arguments<'_>) -> fmt::Result {
    writeln!(out, "lp-{} {}: {}", apic_id, level, args)
}

pub struct SerialLogger {
    serial: SpinLock<Serial>,
}

impl SerialLogger {
    fn new(port: SerialPort) -> Self {
        let mut serial = Serial { port };
        serial.init();
        Self { serial: SpinLock::new(serial) }
    }
}

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let apic_id = apic_id();
            let mut serial = self.serial.lock();
            let _ = format_record(&mut *serial, apic_id, record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Low-level serial writer.
struct Serial {
    port: SerialPort,
}

impl Serial {
    fn init(&mut self) {
        let base = self.port as u16;

        // Disable interrupts
        outb(base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
        // Enable DLAB, divisor 1 -> 115200 baud
        outb(base + UART_OFFSET_LINE_CONTROL, 0x80);
        outb(base + UART_OFFSET_DATA, 0x01);
        outb(base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
        // 8 bits, no parity, one stop bit
        outb(base + UART_OFFSET_LINE_CONTROL, 0x03);
        // Enable FIFO, clear, 14-byte threshold
        outb(base + UART_OFFSET_FIFO_CONTROL, 0xC7);
        // RTS/DSR set
        outb(base + UART_OFFSET_MODEM_CONTROL, 0x03);
    }

    fn write_byte(&mut self, byte: u8) {
        let base = self.port as u16;
        while inb(base + UART_OFFSET_LINE_STATUS) & UART_LINE_STATUS_THRE == 0 {
            core::hint::spin_loop();
        }
        outb(base + UART_OFFSET_DATA, byte);
    }
}

impl Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

#[cfg(target_arch = "x86_64")]
fn apic_id() -> u32 {
    use crate::intel::platform::Platform;
    crate::intel::support::Hardware.apic_id()
}

#[cfg(not(target_arch = "x86_64"))]
fn apic_id() -> u32 {
    0
}

#[cfg(target_arch = "x86_64")]
fn outb(port: u16, value: u8) {
    unsafe { x86::io::outb(port, value) };
}

#[cfg(target_arch = "x86_64")]
fn inb(port: u16) -> u8 {
    unsafe { x86::io::inb(port) }
}

#[cfg(not(target_arch = "x86_64"))]
fn outb(_port: u16, _value: u8) {}

#[cfg(not(target_arch = "x86_64"))]
fn inb(_port: u16) -> u8 {
    UART_LINE_STATUS_THRE
}

//! 16550 UART on COM1 (port 0x3F8).
//!
//! The serial console is the primary debug channel; VGA output is mirrored
//! here so logs are captured even under emulators run headless.

use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::port::Port;

const COM1_BASE: u16 = 0x3F8;

struct SerialPort {
    data: Port<u8>,
    line_status: Port<u8>,
}

impl SerialPort {
    const fn new(base: u16) -> Self {
        SerialPort {
            data: Port::new(base),
            line_status: Port::new(base + 5),
        }
    }

    fn init(&mut self) {
        let mut int_enable = Port::<u8>::new(COM1_BASE + 1);
        let mut fifo_ctrl = Port::<u8>::new(COM1_BASE + 2);
        let mut line_ctrl = Port::<u8>::new(COM1_BASE + 3);
        let mut modem_ctrl = Port::<u8>::new(COM1_BASE + 4);
        unsafe {
            int_enable.write(0x00); // no interrupts, we poll
            line_ctrl.write(0x80); // DLAB on
            self.data.write(0x01); // divisor 1 -> 115200 baud
            int_enable.write(0x00);
            line_ctrl.write(0x03); // 8N1, DLAB off
            fifo_ctrl.write(0xC7); // FIFO on, clear, 14-byte threshold
            modem_ctrl.write(0x0B); // DTR + RTS + OUT2
        }
    }

    fn write_byte(&mut self, byte: u8) {
        unsafe {
            // Wait for the transmit holding register to drain.
            while self.line_status.read() & 0x20 == 0 {
                core::hint::spin_loop();
            }
            self.data.write(byte);
        }
    }
}

impl fmt::Write for SerialPort {
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

lazy_static! {
    static ref COM1: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1_BASE));
}

pub fn init() {
    COM1.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    COM1.lock().write_fmt(args).ok();
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => ($crate::serial::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}

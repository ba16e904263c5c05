//! VGA text-mode console.
//!
//! Writes directly to the text buffer at `0xB8000`. The writer is guarded by a
//! spinlock so output from different CPUs does not interleave mid-line.

use core::fmt;
use core::ptr::{read_volatile, write_volatile};
use lazy_static::lazy_static;
use spin::Mutex;

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;
const VGA_BUFFER_ADDR: usize = 0xB8000;

/// Light grey on black.
const DEFAULT_ATTR: u8 = 0x07;

pub struct Writer {
    column: usize,
    row: usize,
}

impl Writer {
    const fn new() -> Self {
        Writer { column: 0, row: 0 }
    }

    #[inline]
    fn cell(row: usize, col: usize) -> *mut u16 {
        (VGA_BUFFER_ADDR + 2 * (row * BUFFER_WIDTH + col)) as *mut u16
    }

    fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            byte => {
                if self.column >= BUFFER_WIDTH {
                    self.new_line();
                }
                let encoded = (DEFAULT_ATTR as u16) << 8 | byte as u16;
                unsafe { write_volatile(Self::cell(self.row, self.column), encoded) };
                self.column += 1;
            }
        }
    }

    fn new_line(&mut self) {
        self.column = 0;
        if self.row + 1 < BUFFER_HEIGHT {
            self.row += 1;
            return;
        }
        // Scroll: move every row up one, blank the last.
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let c = unsafe { read_volatile(Self::cell(row, col)) };
                unsafe { write_volatile(Self::cell(row - 1, col), c) };
            }
        }
        Self::clear_row(BUFFER_HEIGHT - 1);
    }

    fn clear_row(row: usize) {
        let blank = (DEFAULT_ATTR as u16) << 8 | b' ' as u16;
        for col in 0..BUFFER_WIDTH {
            unsafe { write_volatile(Self::cell(row, col), blank) };
        }
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            // Printable ASCII or newline; anything else becomes a block.
            match byte {
                0x20..=0x7e | b'\n' => self.write_byte(byte),
                _ => self.write_byte(0xfe),
            }
        }
        Ok(())
    }
}

lazy_static! {
    static ref WRITER: Mutex<Writer> = Mutex::new(Writer::new());
}

/// Blank the whole screen and reset the cursor.
pub fn clear() {
    let mut writer = WRITER.lock();
    for row in 0..BUFFER_HEIGHT {
        Writer::clear_row(row);
    }
    writer.row = 0;
    writer.column = 0;
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    // Mirror everything to the serial port so output survives without a display.
    crate::serial::_print(args);
    WRITER.lock().write_fmt(args).ok();
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::vga_buffer::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

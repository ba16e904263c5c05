#![no_std]

pub mod serial;
pub mod vga_buffer;

// print!/println!/serial_print!/serial_println! are exported at the crate
// root via #[macro_export]; dependants pull them in with #[macro_use].

pub fn init() {
    serial::init();
    vga_buffer::clear();
}

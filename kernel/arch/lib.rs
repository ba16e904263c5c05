#![no_std]
#![feature(abi_x86_interrupt)]
extern crate alloc;

#[macro_use]
extern crate drivers;
#[macro_use]
extern crate klog;

#[cfg(test)]
extern crate std;

pub mod acpi;
pub mod apic;
pub mod cpu;
pub mod gdt;
pub mod hpet;
pub mod interrupts;
pub mod ipi;
pub mod processor;
pub mod smp;
pub mod trampoline;

#[cfg(test)]
pub(crate) mod sim;

/// Base of the high-half window that direct-maps the first 4 GiB of physical
/// memory. Established by the early paging code before any of this crate runs.
pub const PHYSICAL_MEMORY_OFFSET: u64 = 0xffff_ffff_8000_0000;

pub use ipi::{on_signal_received, signal, IpiMessage};
pub use processor::{count as processor_count, MAX_CPUS};
pub use smp::{ap_entry, mark_scheduler_online, mp_init, this_processor_id};

/// Bootstrap-processor architecture init: descriptor tables and FPU.
///
/// Must run before interrupts are enabled and before `mp_init`; the IDT it
/// loads carries the NMI entry the signal channel depends on.
pub fn init() {
    gdt::init();
    interrupts::init();
    cpu::enable_fp();
    klog_always!("Arch initialised (GDT/IDT loaded, FPU enabled)");
}

#![no_std]
#![no_main]
#![feature(alloc_error_handler)]

extern crate alloc;

use core::panic::PanicInfo;

#[macro_use]
extern crate drivers;
#[macro_use]
extern crate klog;

use linked_list_allocator::LockedHeap;

/// Boot information handed over by the loader.
#[repr(C)]
pub struct BootInfo {
    /// Physical address of the ACPI RSDP, or 0 when the loader could not
    /// find one (legacy BIOS systems are scanned instead).
    pub rsdp_address: u64,
}

// ============================================================================
// Boot Heap
// ============================================================================

/// Boot heap size (1 MiB). Enough for the processor table, signal slots, and
/// AP stacks; the real memory manager takes over later.
const BOOT_HEAP_SIZE: usize = 1024 * 1024;

#[repr(C, align(16))]
struct HeapArena([u8; BOOT_HEAP_SIZE]);

static mut BOOT_HEAP: HeapArena = HeapArena([0; BOOT_HEAP_SIZE]);

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

fn init_heap() {
    unsafe {
        ALLOCATOR
            .lock()
            .init(&raw mut BOOT_HEAP.0 as *mut u8, BOOT_HEAP_SIZE);
    }
}

#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("boot heap exhausted allocating {:?}", layout);
}

// ============================================================================
// Entry
// ============================================================================

#[no_mangle]
pub extern "C" fn kernel_main(boot_info: &'static BootInfo) -> ! {
    drivers::init();
    klog::set_level(klog::Level::Info);
    klog_always!("Ion-OS kernel starting");

    init_heap();

    // BSP descriptor tables and FPU; loads the IDT whose NMI entry backs the
    // inter-processor signal channel.
    arch::init();

    arch::acpi::set_rsdp_address(boot_info.rsdp_address);

    // The boot sequencer's timing windows come from the HPET; a machine
    // without one cannot run the bring-up protocol.
    match arch::hpet::init() {
        Ok(info) => klog_always!("HPET online at {} Hz", info.frequency_hz),
        Err(e) => panic!("HPET unavailable: {:?}", e),
    }

    // Bring every application processor to its idle loop. Returns with
    // interrupts enabled and all CPUs running.
    arch::mp_init();
    klog_always!("All {} processor(s) online", arch::processor_count());

    // Scheduler init would land here. Until one exists, release the APs
    // into their idle loops.
    arch::mark_scheduler_online();

    idle()
}

fn idle() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

// ============================================================================
// Panic
// ============================================================================

/// All roads end here: log what happened and halt. The serial write is
/// unconditional so a panic is visible even before the log filter opens.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    serial_println!("KERNEL PANIC: {}", info);
    loop {
        x86_64::instructions::hlt();
    }
}

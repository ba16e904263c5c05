//! Interrupt descriptor table and exception handlers.
//!
//! One IDT is shared by every CPU; each CPU executes `lidt` against it during
//! its own init. The NMI entry is the receive side of the inter-processor
//! signal channel: it first offers the interrupt to `ipi::on_signal_received`,
//! and only when the channel does not claim it is the NMI treated as what it
//! otherwise is — a hardware event we can do nothing about.

use core::sync::atomic::{AtomicU64, Ordering};
use lazy_static::lazy_static;
use x86_64::instructions::interrupts as x86_interrupts;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::apic::SPURIOUS_VECTOR;
use crate::{gdt, ipi};

/// Counters for interrupts that are handled rather than fatal.
pub struct InterruptStats {
    pub breakpoint: AtomicU64,
    pub nmi_total: AtomicU64,
    pub nmi_stray: AtomicU64,
    pub spurious: AtomicU64,
}

pub static INTERRUPT_STATS: InterruptStats = InterruptStats {
    breakpoint: AtomicU64::new(0),
    nmi_total: AtomicU64::new(0),
    nmi_stray: AtomicU64::new(0),
    spurious: AtomicU64::new(0),
};

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt[SPURIOUS_VECTOR].set_handler_fn(spurious_handler);
        idt
    };
}

/// Load the IDT on the BSP. Must run before `mp_init`: the NMI entry has to
/// be live before the first signal can possibly be sent.
pub fn init() {
    IDT.load();
}

/// Load the shared IDT on an application processor.
pub fn load_for_ap() {
    IDT.load();
}

/// Enable interrupts on the executing CPU.
#[inline]
pub fn enable() {
    x86_interrupts::enable();
}

/// Disable interrupts on the executing CPU.
#[inline]
pub fn disable() {
    x86_interrupts::disable();
}

#[inline]
pub fn are_enabled() -> bool {
    x86_interrupts::are_enabled()
}

// ============================================================================
// Handlers
// ============================================================================

extern "x86-interrupt" fn divide_error_handler(_stack_frame: InterruptStackFrame) {
    // No output here: formatting in an exception handler can deadlock the
    // console lock the faulting code may hold.
    panic!("divide error");
}

/// NMI: either a kernel signal from another processor or a hardware event.
extern "x86-interrupt" fn nmi_handler(_stack_frame: InterruptStackFrame) {
    INTERRUPT_STATS.nmi_total.fetch_add(1, Ordering::Relaxed);
    if !ipi::on_signal_received() {
        // Not ours. Likely a hardware error line; nothing useful to do.
        INTERRUPT_STATS.nmi_stray.fetch_add(1, Ordering::Relaxed);
    }
}

extern "x86-interrupt" fn breakpoint_handler(_stack_frame: InterruptStackFrame) {
    INTERRUPT_STATS.breakpoint.fetch_add(1, Ordering::Relaxed);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    panic!("invalid opcode at {:#x}", stack_frame.instruction_pointer);
}

extern "x86-interrupt" fn general_protection_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    panic!(
        "general protection fault (error {:#x}) at {:#x}",
        error_code, stack_frame.instruction_pointer
    );
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let addr = x86_64::registers::control::Cr2::read_raw();
    panic!(
        "page fault at {:#x} accessing {:#x} ({:?})",
        stack_frame.instruction_pointer, addr, error_code
    );
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("double fault at {:#x}", stack_frame.instruction_pointer);
}

extern "x86-interrupt" fn spurious_handler(_stack_frame: InterruptStackFrame) {
    // Spurious vector: no EOI, no work.
    INTERRUPT_STATS.spurious.fetch_add(1, Ordering::Relaxed);
}

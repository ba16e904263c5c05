//! AP startup trampoline: the 16-bit entry blob and its loader.
//!
//! A STARTUP IPI can only point an AP at a page-aligned physical address
//! below 1 MiB (the 8-bit vector encodes the page number), and the AP arrives
//! there in real mode. The blob below walks it up to long mode: load a
//! minimal GDT, enable protected mode, enable PAE, adopt the kernel's CR3,
//! set EFER.LME, enable paging, then jump to 64-bit code that picks up a
//! stack and the kernel entry point from the mailbox words at the end of the
//! blob.
//!
//! The blob is assembled position-dependent for [`TRAMPOLINE_PADDR`]: every
//! absolute reference is written as `TRAMPOLINE_BASE + (label - start)`, so
//! the copy placed by [`stage`] is the one that runs. The linker only
//! provides the start/end symbols the loader copies between.
//!
//! The boot sequencer wakes APs one at a time, so the single mailbox is
//! never read by more than one AP at once.

use core::arch::global_asm;
use core::ptr::{addr_of, write_volatile};
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::registers::control::Cr3;

use crate::processor::MAX_CPUS;

/// Physical frame the blob is copied to. Vector 1 in the STARTUP IPI.
/// The memory subsystem guarantees this frame is identity-mapped and
/// writable before bring-up starts.
pub const TRAMPOLINE_PADDR: u64 = 0x1000;

/// STARTUP IPI vector encoding the trampoline page.
pub const fn startup_vector() -> u8 {
    (TRAMPOLINE_PADDR >> 12) as u8
}

/// Per-AP kernel stack size (16 KiB).
const AP_STACK_SIZE: usize = 16 * 1024;

global_asm!(
    r#"
.set TRAMPOLINE_BASE, 0x1000

.section .ap_trampoline, "ax"
.balign 16
.code16
.global ap_trampoline_start
ap_trampoline_start:
    cli
    cld
    xorw %ax, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    lgdtl TRAMPOLINE_BASE + (ap_boot_gdt_descr - ap_trampoline_start)
    movl %cr0, %eax
    orl $1, %eax
    movl %eax, %cr0
    ljmpl $0x08, $(TRAMPOLINE_BASE + (ap_protected_entry - ap_trampoline_start))

.balign 8
ap_boot_gdt:
    .quad 0x0000000000000000
    .quad 0x00CF9A000000FFFF    /* 0x08: 32-bit code */
    .quad 0x00CF92000000FFFF    /* 0x10: data */
    .quad 0x00AF9A000000FFFF    /* 0x18: 64-bit code */
ap_boot_gdt_descr:
    .word 0x1F
    .long TRAMPOLINE_BASE + (ap_boot_gdt - ap_trampoline_start)

.code32
ap_protected_entry:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss

    /* CR4: PAE | PGE */
    movl %cr4, %eax
    orl $0xA0, %eax
    movl %eax, %cr4

    /* Adopt the kernel page tables from the mailbox. */
    movl TRAMPOLINE_BASE + (ap_boot_cr3 - ap_trampoline_start), %eax
    movl %eax, %cr3

    /* EFER: LME | NXE | SCE */
    movl $0xC0000080, %ecx
    rdmsr
    orl $0x901, %eax
    wrmsr

    /* CR0: PG | PE -- paging on activates long mode */
    movl %cr0, %eax
    orl $0x80000001, %eax
    movl %eax, %cr0
    ljmpl $0x18, $(TRAMPOLINE_BASE + (ap_long_entry - ap_trampoline_start))

.code64
ap_long_entry:
    movq TRAMPOLINE_BASE + (ap_boot_stack_ptr - ap_trampoline_start), %rsp
    andq $-16, %rsp
    movq TRAMPOLINE_BASE + (ap_boot_entry_ptr - ap_trampoline_start), %rax
    callq *%rax
1:  cli
    hlt
    jmp 1b

/* Mailbox: written by the BSP before each STARTUP IPI. */
.balign 8
.global ap_boot_cr3
ap_boot_cr3:
    .quad 0
.global ap_boot_stack_ptr
ap_boot_stack_ptr:
    .quad 0
.global ap_boot_entry_ptr
ap_boot_entry_ptr:
    .quad 0
.global ap_trampoline_end
ap_trampoline_end:

.text
"#,
    options(att_syntax)
);

extern "C" {
    static ap_trampoline_start: u8;
    static ap_trampoline_end: u8;
    static ap_boot_cr3: u8;
    static ap_boot_stack_ptr: u8;
    static ap_boot_entry_ptr: u8;
}

/// Kernel stack top handed to each AP, recorded so the onboarding path can
/// find its own stack again for the TSS.
static AP_STACK_TOPS: [AtomicU64; MAX_CPUS] = {
    const INIT: AtomicU64 = AtomicU64::new(0);
    [INIT; MAX_CPUS]
};

/// Offset of a blob symbol from the blob start.
fn blob_offset(sym: *const u8) -> u64 {
    sym as u64 - unsafe { addr_of!(ap_trampoline_start) } as u64
}

/// Patch one mailbox word in the staged copy.
fn mailbox_store(sym: *const u8, value: u64) {
    let dest = (TRAMPOLINE_PADDR + blob_offset(sym)) as *mut u64;
    unsafe { write_volatile(dest, value) };
}

/// Copy the trampoline blob to [`TRAMPOLINE_PADDR`] and fill the mailbox
/// words that are the same for every AP.
///
/// Must complete before the first STARTUP IPI is issued.
///
/// # Safety
///
/// The destination frame must be identity-mapped and writable, and no AP may
/// be executing from it.
pub unsafe fn stage(entry: extern "C" fn() -> !) {
    let start = addr_of!(ap_trampoline_start) as *const u8;
    let len = addr_of!(ap_trampoline_end) as usize - start as usize;
    assert!(
        len <= 0x1000,
        "trampoline blob ({} bytes) exceeds its page",
        len
    );

    core::ptr::copy_nonoverlapping(start, TRAMPOLINE_PADDR as *mut u8, len);

    // The page tables and the kernel entry are shared by every AP.
    let (frame, _) = Cr3::read();
    mailbox_store(addr_of!(ap_boot_cr3), frame.start_address().as_u64());
    mailbox_store(addr_of!(ap_boot_entry_ptr), entry as usize as u64);

    klog!(
        Info,
        "SMP: trampoline staged at {:#x} ({} bytes)",
        TRAMPOLINE_PADDR,
        len
    );
}

/// Stage the per-AP mailbox state for `cpu`: allocate its kernel stack and
/// point the blob's stack word at it.
///
/// Called by the boot sequencer immediately before it wakes `cpu`; the
/// sequential bring-up order is what makes reusing the single mailbox safe.
pub fn prepare_ap(cpu: usize) {
    let stack_top = alloc_ap_stack();
    AP_STACK_TOPS[cpu].store(stack_top, Ordering::Release);
    mailbox_store(unsafe { addr_of!(ap_boot_stack_ptr) }, stack_top);
}

/// The kernel stack top handed to `cpu` by [`prepare_ap`].
pub fn ap_stack_top(cpu: usize) -> u64 {
    let top = AP_STACK_TOPS[cpu].load(Ordering::Acquire);
    assert!(top != 0, "no stack staged for CPU {}", cpu);
    top
}

/// Allocate a kernel stack for an AP and return its (16-byte aligned) top.
/// AP stacks are never freed; the processor set is fixed for the life of the
/// kernel.
fn alloc_ap_stack() -> u64 {
    let stack = alloc::vec![0u8; AP_STACK_SIZE].into_boxed_slice();
    let top = stack.as_ptr() as u64 + AP_STACK_SIZE as u64;
    core::mem::forget(stack);
    top & !0xF
}

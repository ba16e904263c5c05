//! CPU-local feature initialisation.
//!
//! Every processor — BSP at early boot, each AP during onboarding — runs
//! through the same set of per-CPU register programming: clearing the kernel
//! GS base so nothing mistakes a fresh CPU for one running a thread,
//! programming the PAT so memory types agree across the machine, preparing
//! the SYSCALL MSRs, and enabling FPU/SSE state.

use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};
use x86_64::registers::model_specific::Msr;

use crate::gdt;

const IA32_EFER: u32 = 0xC000_0080;
const IA32_STAR: u32 = 0xC000_0081;
const IA32_LSTAR: u32 = 0xC000_0082;
const IA32_SFMASK: u32 = 0xC000_0084;
const IA32_KERNEL_GS_BASE: u32 = 0xC000_0102;
const IA32_PAT: u32 = 0x277;

/// EFER System Call Extensions bit.
const EFER_SCE: u64 = 1 << 0;

/// RFLAGS bits cleared on SYSCALL entry: IF, TF, DF, AC, IOPL, NT, RF.
const SFMASK_CLEARED: u64 = (1 << 9) | (1 << 8) | (1 << 10) | (1 << 18) | (3 << 12) | (1 << 14) | (1 << 16);

/// PAT layout: the power-on default in slots 0-5 with write-combining in
/// slot 6. Must be identical on every CPU or mixed-mapping behaviour is
/// undefined.
///
/// PAT0=WB PAT1=WT PAT2=UC- PAT3=UC PAT4=WB PAT5=WT PAT6=WC PAT7=UC
const PAT_VALUE: u64 = 0x0001_0406_0007_0406;

#[inline]
fn wrmsr(msr: u32, value: u64) {
    unsafe { Msr::new(msr).write(value) }
}

#[inline]
fn rdmsr(msr: u32) -> u64 {
    unsafe { Msr::new(msr).read() }
}

/// Zero `IA32_KERNEL_GS_BASE`.
///
/// The kernel GS base carries the per-CPU current-task pointer once
/// scheduling exists; zeroing it first means an early exception on a fresh
/// CPU cannot be attributed to a thread that does not run here.
pub fn clear_kernel_gs_base() {
    wrmsr(IA32_KERNEL_GS_BASE, 0);
}

/// Program the PAT with the kernel's memory-type layout.
pub fn init_pat() {
    wrmsr(IA32_PAT, PAT_VALUE);
}

/// Enable FPU/SSE on the executing CPU.
///
/// CR0: coprocessor emulation off, monitoring on, TS cleared so the first
/// FP instruction does not fault. CR4: FXSAVE/FXRSTOR and SSE exceptions.
pub fn enable_fp() {
    unsafe {
        let mut cr0 = Cr0::read();
        cr0.remove(Cr0Flags::EMULATE_COPROCESSOR);
        cr0.remove(Cr0Flags::TASK_SWITCHED);
        cr0.insert(Cr0Flags::MONITOR_COPROCESSOR);
        Cr0::write(cr0);

        let mut cr4 = Cr4::read();
        cr4.insert(Cr4Flags::OSFXSR);
        cr4.insert(Cr4Flags::OSXMMEXCPT_ENABLE);
        Cr4::write(cr4);
    }
}

/// Landing point for SYSCALL before the syscall layer has installed its
/// entry stub. Executing a syscall this early is unrecoverable.
extern "C" fn syscall_unconfigured() -> ! {
    panic!("SYSCALL executed before the syscall layer was initialised");
}

/// Prepare the SYSCALL/SYSRET MSRs on the executing CPU.
///
/// STAR layout (64-bit mode):
/// - bits 63:48 — SYSRET selector base (`CS = base + 16`, `SS = base + 8`)
/// - bits 47:32 — SYSCALL kernel code selector (`SS = CS + 8`)
///
/// LSTAR points at a fail-fast stub until the syscall layer replaces it via
/// [`set_syscall_entry`].
///
/// # Safety
///
/// The GDT for this CPU must already be loaded; its selector layout is what
/// the STAR value encodes.
pub unsafe fn init_syscall_msrs() {
    let sel = gdt::selectors();
    let kernel_cs = sel.kernel_code.0 as u64;
    let user_data = sel.user_data.0 as u64;

    // SYSRET (64-bit): CS = STAR[63:48] + 16, SS = STAR[63:48] + 8, RPL 3.
    let sysret_base = (user_data - 8) | 3;
    wrmsr(IA32_STAR, (sysret_base << 48) | (kernel_cs << 32));
    wrmsr(IA32_LSTAR, syscall_unconfigured as usize as u64);
    wrmsr(IA32_SFMASK, SFMASK_CLEARED);

    wrmsr(IA32_EFER, rdmsr(IA32_EFER) | EFER_SCE);
}

/// Install the real syscall entry stub. Called once per CPU by the syscall
/// layer after it comes up.
///
/// # Safety
///
/// `entry` must be a valid SYSCALL entry stub address.
pub unsafe fn set_syscall_entry(entry: u64) {
    wrmsr(IA32_LSTAR, entry);
}

//! Local APIC and I/O APIC driver.
//!
//! The local APIC is the per-CPU interrupt controller; it is what carries the
//! INIT/STARTUP handshake that wakes an application processor and the NMI
//! doorbell behind the inter-processor signal channel. The I/O APIC routes
//! external device interrupts and is only touched here to mask everything
//! during bring-up.
//!
//! The rest of the crate talks to the controller through the
//! [`InterruptController`] trait so the bring-up and signalling logic can be
//! driven by a recording mock on a host. [`LocalApic`] is the hardware
//! implementation.

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

// ============================================================================
// Controller Interface
// ============================================================================

/// IPI destination shorthand, mirroring the ICR encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiShorthand {
    /// No shorthand: the destination field selects the target.
    None,
    SelfOnly,
    AllIncludingSelf,
    AllExcludingSelf,
}

/// IPI delivery class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiKind {
    /// Reset the target into the wait-for-SIPI state.
    Init,
    /// Start the target at `vector * 0x1000` in real mode.
    Startup,
    /// Non-maskable interrupt; carries no vector.
    Nmi,
    /// Ordinary fixed-vector interrupt.
    Fixed,
}

/// The narrow controller surface the bring-up core consumes.
pub trait InterruptController: Sync {
    /// Hardware id of the executing processor.
    fn local_hw_id(&self) -> u32;

    /// Deliver an IPI. `vector` is ignored for `Init` and `Nmi`.
    fn send_ipi(
        &self,
        hw_id: u32,
        shorthand: IpiShorthand,
        kind: IpiKind,
        vector: u8,
        wait_for_delivery: bool,
    );

    /// Initialise the executing processor's local controller.
    fn init_local(&self);

    /// One-shot global controller setup for an `cpus`-processor system.
    fn init_global(&self, cpus: usize);
}

// ============================================================================
// LAPIC Constants and Registers
// ============================================================================

/// Default LAPIC base address.
pub const LAPIC_DEFAULT_BASE: u64 = 0xFEE0_0000;

/// LAPIC register offsets (memory-mapped).
pub mod lapic {
    pub const ID: u32 = 0x020; // LAPIC ID
    pub const VERSION: u32 = 0x030; // LAPIC Version
    pub const TPR: u32 = 0x080; // Task Priority Register
    pub const EOI: u32 = 0x0B0; // End of Interrupt
    pub const LDR: u32 = 0x0D0; // Logical Destination Register
    pub const DFR: u32 = 0x0E0; // Destination Format Register
    pub const SIVR: u32 = 0x0F0; // Spurious Interrupt Vector Register
    pub const ISR_BASE: u32 = 0x100; // In-Service Register (8 registers)
    pub const ESR: u32 = 0x280; // Error Status Register
    pub const ICR_LOW: u32 = 0x300; // Interrupt Command Register (low)
    pub const ICR_HIGH: u32 = 0x310; // Interrupt Command Register (high)
    pub const LVT_TIMER: u32 = 0x320; // LVT Timer Register
    pub const LVT_THERMAL: u32 = 0x330; // LVT Thermal Sensor Register
    pub const LVT_PERF: u32 = 0x340; // LVT Performance Monitoring Register
    pub const LVT_LINT0: u32 = 0x350; // LVT LINT0 Register
    pub const LVT_LINT1: u32 = 0x360; // LVT LINT1 Register
    pub const LVT_ERROR: u32 = 0x370; // LVT Error Register
}

/// Spurious Interrupt Vector Register bits.
pub mod sivr_bits {
    /// APIC Software Enable (bit 8).
    pub const APIC_ENABLED: u32 = 1 << 8;
}

/// LVT entry bits.
pub mod lvt_bits {
    /// Delivery Mode: ExtINT (111).
    pub const DELIVERY_EXTINT: u32 = 7 << 8;
    /// Masked (interrupt disabled).
    pub const MASKED: u32 = 1 << 16;
}

/// ICR delivery mode.
pub mod icr_delivery {
    pub const FIXED: u32 = 0 << 8;
    pub const NMI: u32 = 4 << 8;
    pub const INIT: u32 = 5 << 8;
    pub const STARTUP: u32 = 6 << 8;
}

/// ICR destination shorthand.
pub mod icr_dest {
    pub const NO_SHORTHAND: u32 = 0 << 18;
    pub const SELF: u32 = 1 << 18;
    pub const ALL_INCLUDING_SELF: u32 = 2 << 18;
    pub const ALL_EXCLUDING_SELF: u32 = 3 << 18;
}

/// ICR flags.
pub mod icr_flags {
    /// Level: Assert (for INIT).
    pub const LEVEL_ASSERT: u32 = 1 << 14;
    /// Level: De-assert.
    pub const LEVEL_DEASSERT: u32 = 0 << 14;
    /// Trigger: Edge.
    pub const TRIGGER_EDGE: u32 = 0 << 15;
    /// Trigger: Level.
    pub const TRIGGER_LEVEL: u32 = 1 << 15;
    /// Delivery Status: Pending (read-only).
    pub const DELIVERY_PENDING: u32 = 1 << 12;
}

/// Spurious interrupt vector; the IDT carries a no-op handler for it.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

// ============================================================================
// APIC State
// ============================================================================

static LAPIC_INITIALIZED: AtomicBool = AtomicBool::new(false);
static IOAPIC_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// LAPIC base address (may be relocated via MSR).
static LAPIC_BASE: AtomicU32 = AtomicU32::new(LAPIC_DEFAULT_BASE as u32);

/// I/O APIC base address.
static IOAPIC_BASE: AtomicU32 = AtomicU32::new(IOAPIC_DEFAULT_BASE as u32);

/// BSP LAPIC ID, recorded during local init.
static BSP_LAPIC_ID: AtomicU32 = AtomicU32::new(0);

// ============================================================================
// LAPIC Operations
// ============================================================================

/// Read a LAPIC register.
///
/// # Safety
///
/// The LAPIC must be mapped at the stored base address.
#[inline]
pub unsafe fn lapic_read(reg: u32) -> u32 {
    let base = LAPIC_BASE.load(Ordering::Relaxed) as u64;
    read_volatile((base + reg as u64) as *const u32)
}

/// Write to a LAPIC register.
///
/// # Safety
///
/// The LAPIC must be mapped at the stored base address.
#[inline]
pub unsafe fn lapic_write(reg: u32, value: u32) {
    let base = LAPIC_BASE.load(Ordering::Relaxed) as u64;
    write_volatile((base + reg as u64) as *mut u32, value);
}

/// Get the current CPU's LAPIC ID.
///
/// # Safety
///
/// LAPIC must be mapped.
#[inline]
pub unsafe fn lapic_id() -> u32 {
    (lapic_read(lapic::ID) >> 24) & 0xFF
}

/// Send End of Interrupt to the LAPIC.
///
/// # Safety
///
/// Must be called in interrupt context after handling the interrupt.
#[inline]
pub unsafe fn lapic_eoi() {
    lapic_write(lapic::EOI, 0);
}

/// Check if the LAPIC is enabled in hardware (IA32_APIC_BASE bit 11).
pub fn lapic_hw_enabled() -> bool {
    let low: u32;
    let high: u32;
    unsafe {
        core::arch::asm!(
            "rdmsr",
            in("ecx") 0x1Bu32,
            out("eax") low,
            out("edx") high,
            options(nomem, nostack)
        );
    }
    let msr_value = ((high as u64) << 32) | (low as u64);
    (msr_value & (1 << 11)) != 0
}

/// Enable the LAPIC via IA32_APIC_BASE.
///
/// # Safety
///
/// Modifies CPU state; early boot only.
pub unsafe fn lapic_hw_enable() {
    let msr: u32 = 0x1B;
    let mut low: u32;
    let high: u32;

    core::arch::asm!(
        "rdmsr",
        in("ecx") msr,
        out("eax") low,
        out("edx") high,
        options(nomem, nostack)
    );
    low |= 1 << 11;
    core::arch::asm!(
        "wrmsr",
        in("ecx") msr,
        in("eax") low,
        in("edx") high,
        options(nomem, nostack)
    );
}

/// Shared LVT/SIVR setup for both the BSP and AP paths.
///
/// # Safety
///
/// LAPIC must be mapped; interrupts should be disabled.
unsafe fn lapic_common_setup(lint0: u32) {
    // Clear any existing errors (a read clears the register).
    lapic_write(lapic::ESR, 0);
    let _ = lapic_read(lapic::ESR);

    // Accept all interrupt priorities.
    lapic_write(lapic::TPR, 0);

    // Flat logical destination model.
    lapic_write(lapic::DFR, 0xFFFF_FFFF);
    lapic_write(lapic::LDR, 1 << 24);

    lapic_write(lapic::LVT_TIMER, lvt_bits::MASKED);
    lapic_write(lapic::LVT_LINT0, lint0);
    lapic_write(lapic::LVT_LINT1, lvt_bits::MASKED);
    lapic_write(lapic::LVT_ERROR, lvt_bits::MASKED);
    lapic_write(lapic::LVT_PERF, lvt_bits::MASKED);
    lapic_write(lapic::LVT_THERMAL, lvt_bits::MASKED);

    // Software-enable with the spurious vector.
    lapic_write(
        lapic::SIVR,
        sivr_bits::APIC_ENABLED | SPURIOUS_VECTOR as u32,
    );

    // Drain any interrupt state left by firmware.
    for i in 0..8 {
        let _ = lapic_read(lapic::ISR_BASE + i * 0x10);
    }
    lapic_eoi();
}

/// Initialise the BSP's LAPIC.
///
/// LINT0 stays in ExtINT mode: it carries the legacy PIC's INTR line, and
/// only the BSP is wired to the PIC.
///
/// # Safety
///
/// Early boot, BSP only, interrupts disabled.
pub unsafe fn init_lapic() {
    if LAPIC_INITIALIZED.load(Ordering::Relaxed) {
        return;
    }
    if !lapic_hw_enabled() {
        lapic_hw_enable();
    }

    BSP_LAPIC_ID.store(lapic_id(), Ordering::Relaxed);
    lapic_common_setup(lvt_bits::DELIVERY_EXTINT);

    LAPIC_INITIALIZED.store(true, Ordering::Release);
}

/// Initialise an application processor's LAPIC.
///
/// Unlike the BSP path, LINT0 is masked: APs are not connected to the 8259
/// PIC and must not receive ExtINT.
///
/// # Safety
///
/// AP context only, after the BSP's `init_lapic`.
pub unsafe fn init_lapic_for_ap() {
    if !lapic_hw_enabled() {
        lapic_hw_enable();
    }
    lapic_common_setup(lvt_bits::MASKED);
}

/// Check if the LAPIC subsystem has been initialised (on the BSP).
#[inline]
pub fn lapic_initialized() -> bool {
    LAPIC_INITIALIZED.load(Ordering::Acquire)
}

/// The BSP's LAPIC ID.
#[inline]
pub fn bsp_lapic_id() -> u32 {
    BSP_LAPIC_ID.load(Ordering::Relaxed)
}

// ============================================================================
// IPI Operations
// ============================================================================

/// Wait for a previous ICR delivery to complete.
///
/// # Safety
///
/// LAPIC must be mapped.
unsafe fn wait_icr_idle() {
    while lapic_read(lapic::ICR_LOW) & icr_flags::DELIVERY_PENDING != 0 {
        core::hint::spin_loop();
    }
}

/// Write the ICR pair, triggering an IPI.
///
/// # Safety
///
/// LAPIC must be mapped; the encoding must be valid for the delivery mode.
unsafe fn icr_send(dest_lapic_id: u32, shorthand_bits: u32, icr_low: u32) {
    wait_icr_idle();
    lapic_write(lapic::ICR_HIGH, dest_lapic_id << 24);
    lapic_write(lapic::ICR_LOW, icr_low | shorthand_bits);
}

/// Send an INIT IPI (assert then de-assert) to reset an AP into the
/// wait-for-SIPI state.
///
/// # Safety
///
/// Only valid during the AP startup sequence.
pub unsafe fn send_init_ipi(dest_lapic_id: u32) {
    icr_send(
        dest_lapic_id,
        icr_dest::NO_SHORTHAND,
        icr_delivery::INIT | icr_flags::LEVEL_ASSERT | icr_flags::TRIGGER_LEVEL,
    );
    wait_icr_idle();
    icr_send(
        dest_lapic_id,
        icr_dest::NO_SHORTHAND,
        icr_delivery::INIT | icr_flags::LEVEL_DEASSERT | icr_flags::TRIGGER_LEVEL,
    );
}

/// Send a STARTUP IPI. `start_page` is the 4 KiB page number the AP begins
/// executing at (real mode, `CS:IP = start_page * 0x1000`).
///
/// # Safety
///
/// Only valid during the AP startup sequence, after an INIT IPI.
pub unsafe fn send_sipi(dest_lapic_id: u32, start_page: u8) {
    icr_send(
        dest_lapic_id,
        icr_dest::NO_SHORTHAND,
        start_page as u32 | icr_delivery::STARTUP | icr_flags::TRIGGER_EDGE,
    );
}

/// Send an edge-triggered IPI with an arbitrary delivery mode and vector.
///
/// # Safety
///
/// LAPIC must be mapped; the vector must be valid for the delivery mode.
pub unsafe fn send_ipi_raw(dest_lapic_id: u32, shorthand_bits: u32, vector: u8, delivery: u32) {
    icr_send(
        dest_lapic_id,
        shorthand_bits,
        vector as u32 | delivery | icr_flags::LEVEL_ASSERT | icr_flags::TRIGGER_EDGE,
    );
}

// ============================================================================
// I/O APIC Operations
// ============================================================================

/// Default I/O APIC base address.
pub const IOAPIC_DEFAULT_BASE: u64 = 0xFEC0_0000;

/// I/O APIC register data offset (read/write at the selected register).
const IOAPIC_REGDATA: u32 = 0x10;

/// I/O APIC registers (accessed via REGSEL/REGDATA).
pub mod ioapic {
    /// I/O APIC Version Register.
    pub const VERSION: u8 = 0x01;
    /// Redirection Table Entry base; entry N is at `0x10 + 2*N`.
    pub const REDIR_TABLE_BASE: u8 = 0x10;
}

/// I/O APIC redirection entry bits.
pub mod redir_bits {
    /// Masked (interrupt disabled).
    pub const MASKED: u64 = 1 << 16;
}

/// Read an I/O APIC register.
///
/// # Safety
///
/// I/O APIC must be mapped at the stored base address.
unsafe fn ioapic_read(reg: u8) -> u32 {
    let base = IOAPIC_BASE.load(Ordering::Relaxed) as u64;
    write_volatile(base as *mut u32, reg as u32);
    read_volatile((base + IOAPIC_REGDATA as u64) as *const u32)
}

/// Write to an I/O APIC register.
///
/// # Safety
///
/// I/O APIC must be mapped at the stored base address.
unsafe fn ioapic_write(reg: u8, value: u32) {
    let base = IOAPIC_BASE.load(Ordering::Relaxed) as u64;
    write_volatile(base as *mut u32, reg as u32);
    write_volatile((base + IOAPIC_REGDATA as u64) as *mut u32, value);
}

/// Write an I/O APIC redirection entry. High word first to avoid a window
/// where a half-written entry is live.
///
/// # Safety
///
/// I/O APIC must be mapped; `irq` must be a valid entry index.
pub unsafe fn ioapic_write_redir(irq: u8, entry: u64) {
    let reg_low = ioapic::REDIR_TABLE_BASE + irq * 2;
    ioapic_write(reg_low + 1, (entry >> 32) as u32);
    ioapic_write(reg_low, entry as u32);
}

/// Number of I/O APIC redirection entries.
///
/// # Safety
///
/// I/O APIC must be mapped.
pub unsafe fn ioapic_max_entries() -> u8 {
    let version = ioapic_read(ioapic::VERSION);
    ((version >> 16) & 0xFF) as u8 + 1
}

/// Initialise the I/O APIC with every redirection entry masked. Device
/// interrupt routing is configured later, by whoever owns the device.
///
/// # Safety
///
/// I/O APIC must be mapped; call after LAPIC init, before enabling interrupts.
pub unsafe fn init_ioapic() {
    if IOAPIC_INITIALIZED.load(Ordering::Relaxed) {
        return;
    }
    let max_entries = ioapic_max_entries();
    for irq in 0..max_entries {
        ioapic_write_redir(irq, redir_bits::MASKED);
    }
    IOAPIC_INITIALIZED.store(true, Ordering::Release);
}

// ============================================================================
// Hardware Controller
// ============================================================================

/// The memory-mapped local APIC as an [`InterruptController`].
pub struct LocalApic;

/// The one hardware controller instance.
pub static LOCAL_APIC: LocalApic = LocalApic;

impl InterruptController for LocalApic {
    fn local_hw_id(&self) -> u32 {
        unsafe { lapic_id() }
    }

    fn send_ipi(
        &self,
        hw_id: u32,
        shorthand: IpiShorthand,
        kind: IpiKind,
        vector: u8,
        wait_for_delivery: bool,
    ) {
        let shorthand_bits = match shorthand {
            IpiShorthand::None => icr_dest::NO_SHORTHAND,
            IpiShorthand::SelfOnly => icr_dest::SELF,
            IpiShorthand::AllIncludingSelf => icr_dest::ALL_INCLUDING_SELF,
            IpiShorthand::AllExcludingSelf => icr_dest::ALL_EXCLUDING_SELF,
        };
        unsafe {
            match kind {
                IpiKind::Init => send_init_ipi(hw_id),
                IpiKind::Startup => send_sipi(hw_id, vector),
                IpiKind::Nmi => send_ipi_raw(hw_id, shorthand_bits, 0, icr_delivery::NMI),
                IpiKind::Fixed => send_ipi_raw(hw_id, shorthand_bits, vector, icr_delivery::FIXED),
            }
            if wait_for_delivery {
                wait_icr_idle();
            }
        }
    }

    /// First caller is the BSP (from `mp_init`, before any AP exists); every
    /// later caller is an AP coming through its onboarding path.
    fn init_local(&self) {
        unsafe {
            if !lapic_initialized() {
                init_lapic();
            } else {
                init_lapic_for_ap();
            }
        }
    }

    fn init_global(&self, cpus: usize) {
        unsafe { init_ioapic() };
        klog!(Info, "APIC: global controllers masked for {} CPUs", cpus);
    }
}

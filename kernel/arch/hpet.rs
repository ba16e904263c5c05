//! HPET (High Precision Event Timer) support.
//!
//! The HPET main counter is the kernel's boot-time clock: a fixed-frequency
//! (typically ~14.318 MHz) monotonic counter with sub-microsecond resolution.
//! The bring-up code consumes it through the [`Timebase`] trait — a "now"
//! reader, a nanosecond-to-tick conversion, and a busy-wait — so the boot
//! sequencer's timing windows can be driven by a synthetic clock on a host.
//!
//! Comparators and HPET interrupts are not used; only the main counter.

use core::ptr::{read_unaligned, read_volatile, write_volatile};
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, Once};

use crate::acpi::{find_table, phys_slice, read_sdt_header, validate_checksum, SdtHeader};
use crate::PHYSICAL_MEMORY_OFFSET;

// ============================================================================
// Timebase Interface
// ============================================================================

/// The narrow clock surface the bring-up core consumes.
pub trait Timebase: Sync {
    /// Current value of the monotonic counter.
    fn now(&self) -> u64;

    /// Convert a nanosecond duration into counter ticks.
    fn ticks_for(&self, nanoseconds: u64) -> u64;

    /// Spin for at least `nanoseconds` of wall time.
    fn busy_wait(&self, nanoseconds: u64);
}

// ============================================================================
// HPET Constants
// ============================================================================

/// HPET register offsets (memory-mapped).
pub mod regs {
    /// General Capabilities and ID Register (64-bit).
    pub const CAPS_ID: usize = 0x000;
    /// General Configuration Register (64-bit).
    pub const CONFIG: usize = 0x010;
    /// Main Counter Value Register (64-bit).
    pub const COUNTER: usize = 0x0F0;

    /// Timer N configuration and capability register.
    pub const fn timer_config(n: usize) -> usize {
        0x100 + 0x20 * n
    }

    /// Timer N comparator register.
    pub const fn timer_comparator(n: usize) -> usize {
        0x108 + 0x20 * n
    }
}

/// General Configuration Register bits.
pub mod config_bits {
    /// Main counter enable.
    pub const ENABLE_CNF: u64 = 1 << 0;
    /// Legacy replacement routing.
    pub const LEG_RT_CNF: u64 = 1 << 1;
}

/// Femtoseconds per second; the capability register reports the counter tick
/// period in femtoseconds.
const FS_PER_SECOND: u64 = 1_000_000_000_000_000;

// ============================================================================
// Capability Register Decoding
// ============================================================================

/// Counter tick period in femtoseconds (capability bits 63:32).
fn caps_tick_period_fs(caps: u64) -> u64 {
    caps >> 32
}

/// Number of timers on this block (capability bits 12:8 hold N-1).
fn caps_timer_count(caps: u64) -> u8 {
    ((caps >> 8) & 0x1F) as u8 + 1
}

/// Whether the main counter is 64 bits wide (capability bit 13).
fn caps_wide_counter(caps: u64) -> bool {
    caps & (1 << 13) != 0
}

/// Counter frequency for a tick period, rounded to the nearest Hz.
///
/// The period field is 32 bits wide, so plain `u64` division is enough.
fn counter_hz(tick_period_fs: u64) -> u64 {
    let hz = FS_PER_SECOND / tick_period_fs;
    let remainder = FS_PER_SECOND % tick_period_fs;
    if remainder * 2 >= tick_period_fs {
        hz + 1
    } else {
        hz
    }
}

// ============================================================================
// HPET Info and Error Types
// ============================================================================

/// HPET hardware information.
#[derive(Debug, Clone, Copy)]
pub struct HpetInfo {
    /// Physical base of the HPET register block.
    pub mmio_base: u64,
    /// Virtual address the registers are accessed through.
    pub regs_virt: u64,
    /// Main counter tick period in femtoseconds.
    pub tick_period_fs: u64,
    /// Derived counter frequency in Hz.
    pub frequency_hz: u64,
    /// Number of comparator timers on the block.
    pub timer_count: u8,
    /// True if the main counter is 64-bit.
    pub wide_counter: bool,
}

/// HPET initialisation errors.
#[derive(Debug, Clone, Copy)]
pub enum HpetInitError {
    /// HPET ACPI table not found (or no RSDP at all).
    TableNotFound,
    /// Table length is invalid.
    InvalidLength,
    /// Table checksum validation failed.
    InvalidChecksum,
    /// HPET base is in an unsupported address space.
    UnsupportedAddressSpace(u8),
    /// HPET base address is zero.
    MissingBase,
    /// Counter period is zero (invalid hardware).
    InvalidPeriod,
}

// ============================================================================
// ACPI HPET Table Structures
// ============================================================================

/// ACPI Generic Address Structure.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GenericAddress {
    address_space_id: u8,
    register_bit_width: u8,
    register_bit_offset: u8,
    access_size: u8,
    address: u64,
}

/// ACPI HPET Description Table.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct HpetTable {
    header: SdtHeader,
    event_timer_block_id: u32,
    base_address: GenericAddress,
    hpet_number: u8,
    minimum_tick: u16,
    page_protection: u8,
}

// ============================================================================
// HPET State
// ============================================================================

/// HPET descriptor, filled in once per boot.
static HPET_STATE: Once<HpetInfo> = Once::new();

/// Cached virtual base for fast counter reads (0 = not initialised).
static HPET_VIRT: AtomicU64 = AtomicU64::new(0);

/// Serialises concurrent `init` callers so the hardware is only programmed
/// once.
static HPET_INIT_LOCK: Mutex<()> = Mutex::new(());

// ============================================================================
// Public API
// ============================================================================

/// Probe and start the HPET, returning its descriptor.
///
/// Locates the HPET via the ACPI tables, quiesces whatever timer state the
/// firmware left behind, restarts the main counter from zero, and caches the
/// hardware description for later reads.
pub fn init() -> Result<HpetInfo, HpetInitError> {
    if let Some(info) = HPET_STATE.get() {
        return Ok(*info);
    }

    let _guard = HPET_INIT_LOCK.lock();
    if let Some(info) = HPET_STATE.get() {
        return Ok(*info);
    }

    let info = unsafe { init_internal()? };
    HPET_STATE.call_once(|| info);
    HPET_VIRT.store(info.regs_virt, Ordering::Release);

    Ok(info)
}

/// The HPET descriptor, if `init` has succeeded.
#[inline]
pub fn info() -> Option<HpetInfo> {
    HPET_STATE.get().copied()
}

/// Read the HPET main counter.
///
/// Returns `None` before a successful `init`. 32-bit counter hardware is
/// masked down accordingly.
#[inline]
pub fn read_main_counter() -> Option<u64> {
    let regs_virt = HPET_VIRT.load(Ordering::Acquire);
    if regs_virt == 0 {
        return None;
    }

    let value = unsafe { read_reg64(regs_virt, regs::COUNTER) };
    if let Some(info) = HPET_STATE.get() {
        if !info.wide_counter {
            return Some(value & 0xFFFF_FFFF);
        }
    }
    Some(value)
}

/// HPET counter frequency in Hz, if initialised.
#[inline]
pub fn frequency_hz() -> Option<u64> {
    HPET_STATE.get().map(|info| info.frequency_hz)
}

// ============================================================================
// Hardware Timebase
// ============================================================================

/// The HPET main counter as a [`Timebase`].
pub struct HpetClock;

/// The one hardware clock instance.
pub static HPET_CLOCK: HpetClock = HpetClock;

impl Timebase for HpetClock {
    fn now(&self) -> u64 {
        read_main_counter().unwrap_or_else(|| panic!("HPET timebase used before init"))
    }

    fn ticks_for(&self, nanoseconds: u64) -> u64 {
        let freq = frequency_hz().unwrap_or_else(|| panic!("HPET timebase used before init"));
        ((nanoseconds as u128 * freq as u128) / 1_000_000_000u128) as u64
    }

    fn busy_wait(&self, nanoseconds: u64) {
        let ticks = self.ticks_for(nanoseconds);
        let start = self.now();
        // wrapping_sub keeps 32-bit counter hardware correct across rollover.
        while self.now().wrapping_sub(start) < ticks {
            core::hint::spin_loop();
        }
    }
}

// ============================================================================
// Internal Implementation
// ============================================================================

/// Find the ACPI "HPET" table and return the register block's physical base.
fn locate_hpet_base() -> Result<u64, HpetInitError> {
    let table_phys = find_table(b"HPET").ok_or(HpetInitError::TableNotFound)?;

    let header = read_sdt_header(table_phys).ok_or(HpetInitError::InvalidLength)?;
    if &header.signature != b"HPET" {
        return Err(HpetInitError::TableNotFound);
    }

    let total_len = header.length as usize;
    if total_len < core::mem::size_of::<HpetTable>() {
        return Err(HpetInitError::InvalidLength);
    }

    let table_bytes = phys_slice(table_phys, total_len).ok_or(HpetInitError::InvalidLength)?;
    if !validate_checksum(table_bytes) {
        return Err(HpetInitError::InvalidChecksum);
    }

    let table: HpetTable = unsafe { read_unaligned(table_bytes.as_ptr() as *const HpetTable) };

    // The register block must live in system memory, not I/O port space.
    let space = table.base_address.address_space_id;
    if space != 0 {
        return Err(HpetInitError::UnsupportedAddressSpace(space));
    }

    let mmio_base = table.base_address.address;
    if mmio_base == 0 {
        return Err(HpetInitError::MissingBase);
    }
    Ok(mmio_base)
}

/// Zero the configuration and comparator of every timer on the block.
///
/// Firmware sometimes leaves a comparator armed; an interrupt from one during
/// bring-up would be misattributed.
///
/// # Safety
///
/// `regs_virt` must be the mapped register base and the main counter must be
/// halted.
unsafe fn disarm_timers(regs_virt: u64, timers: u8) {
    for n in 0..timers as usize {
        write_reg64(regs_virt, regs::timer_config(n), 0);
        write_reg64(regs_virt, regs::timer_comparator(n), 0);
    }
}

/// Locate, validate, and start the HPET.
///
/// # Safety
///
/// Requires the ACPI tables and the HPET MMIO region to be reachable through
/// the physical-memory window; modifies HPET hardware registers.
unsafe fn init_internal() -> Result<HpetInfo, HpetInitError> {
    let mmio_base = locate_hpet_base()?;
    let regs_virt = PHYSICAL_MEMORY_OFFSET + mmio_base;

    let caps = read_reg64(regs_virt, regs::CAPS_ID);
    let tick_period_fs = caps_tick_period_fs(caps);
    if tick_period_fs == 0 {
        return Err(HpetInitError::InvalidPeriod);
    }
    let timer_count = caps_timer_count(caps);

    // Halt the counter and drop legacy routing before touching anything
    // else; the block keeps ticking through firmware state otherwise.
    let config = read_reg64(regs_virt, regs::CONFIG)
        & !(config_bits::ENABLE_CNF | config_bits::LEG_RT_CNF);
    write_reg64(regs_virt, regs::CONFIG, config);

    disarm_timers(regs_virt, timer_count);

    // Restart the count from zero, then switch the counter back on.
    write_reg64(regs_virt, regs::COUNTER, 0);
    write_reg64(regs_virt, regs::CONFIG, config | config_bits::ENABLE_CNF);

    let info = HpetInfo {
        mmio_base,
        regs_virt,
        tick_period_fs,
        frequency_hz: counter_hz(tick_period_fs),
        timer_count,
        wide_counter: caps_wide_counter(caps),
    };

    klog!(
        Info,
        "HPET: phys={:#x} freq={} Hz timers={} 64-bit={}",
        info.mmio_base,
        info.frequency_hz,
        info.timer_count,
        info.wide_counter
    );

    Ok(info)
}

/// Read a 64-bit HPET register.
///
/// # Safety
///
/// `regs_virt` must be a valid mapped HPET register base.
#[inline]
unsafe fn read_reg64(regs_virt: u64, offset: usize) -> u64 {
    read_volatile((regs_virt + offset as u64) as *const u64)
}

/// Write a 64-bit HPET register.
///
/// # Safety
///
/// `regs_virt` must be a valid mapped HPET register base.
#[inline]
unsafe fn write_reg64(regs_virt: u64, offset: usize, value: u64) {
    write_volatile((regs_virt + offset as u64) as *mut u64, value);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_hz_common_periods() {
        // The usual 14.31818 MHz block advertises a 69841279 fs period;
        // 10^15 / 69841279 = 14318179.8.. rounds up.
        assert_eq!(counter_hz(69_841_279), 14_318_180);
        // An exact divisor stays exact: 100 ns period -> 10 MHz.
        assert_eq!(counter_hz(100_000_000), 10_000_000);
        // Below the halfway point rounds down, past it rounds up.
        assert_eq!(counter_hz(3), 333_333_333_333_333);
        assert_eq!(counter_hz(7), 142_857_142_857_143);
    }

    #[test]
    fn test_caps_decoding() {
        // Period in the top half, timer count in bits 12:8 (N-1), width in
        // bit 13.
        let caps = (69_841_279u64 << 32) | (1 << 13) | (2 << 8);
        assert_eq!(caps_tick_period_fs(caps), 69_841_279);
        assert_eq!(caps_timer_count(caps), 3);
        assert!(caps_wide_counter(caps));

        let narrow = 7u64 << 32;
        assert_eq!(caps_timer_count(narrow), 1);
        assert!(!caps_wide_counter(narrow));
    }

    #[test]
    fn test_timer_register_layout() {
        assert_eq!(regs::timer_config(0), 0x100);
        assert_eq!(regs::timer_comparator(0), 0x108);
        assert_eq!(regs::timer_config(2), 0x140);
    }
}

//! The processor table: one record per logical processor found in firmware.
//!
//! Records are created once, during enumeration, and live for the whole boot.
//! The only field that ever changes afterwards is the `running` latch, which
//! each processor flips exactly once when its onboarding completes. Everything
//! cross-CPU goes through indices (`kernel id`s) rather than pointers.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Once;

use crate::acpi::{LocalApicFlags, MadtEntry};

/// Maximum number of CPUs supported.
pub const MAX_CPUS: usize = 64;

/// Architecture-specific per-processor data. Opaque to the bring-up logic.
#[derive(Debug, Clone, Copy)]
pub struct ArchCpuData {
    /// Firmware processor UID from the MADT entry; kept for diagnostics.
    pub acpi_uid: u8,
    /// Local-APIC flags from the MADT entry; kept for diagnostics.
    pub lapic_flags: LocalApicFlags,
}

/// One logical processor.
pub struct Processor {
    /// Dense kernel-assigned id, equal to this record's table index.
    id: usize,
    /// Hardware id (the local-APIC id on x86-64).
    hw_id: u32,
    /// Latched once the processor has completed onboarding. Monotonic:
    /// `false -> true` exactly once per boot, never back.
    running: AtomicBool,
    arch: ArchCpuData,
}

impl Processor {
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn hw_id(&self) -> u32 {
        self.hw_id
    }

    #[inline]
    pub fn arch_data(&self) -> &ArchCpuData {
        &self.arch
    }

    /// Whether this processor has published `running`.
    ///
    /// A `true` result implies the processor finished every onboarding step
    /// ordered before the publish (acquire pairs with the release store).
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Ordered registry of all processors, indexed by kernel id.
pub struct ProcessorTable {
    procs: Box<[Processor]>,
}

impl ProcessorTable {
    /// Number of processors. Fixed after enumeration.
    #[inline]
    pub fn count(&self) -> usize {
        self.procs.len()
    }

    /// The record for `kernel_id`. Panics on an out-of-range id, which can
    /// only mean a corrupted caller.
    #[inline]
    pub fn get(&self, kernel_id: usize) -> &Processor {
        &self.procs[kernel_id]
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Processor> {
        self.procs.iter()
    }

    /// Latch `running` for `kernel_id`.
    ///
    /// Release ordering: everything the onboarding path did before this store
    /// is visible to whoever observes `is_running() == true`.
    pub fn mark_running(&self, kernel_id: usize) {
        self.procs[kernel_id].running.store(true, Ordering::Release);
    }

    /// Resolve a hardware id to its kernel id.
    pub fn id_for_hw(&self, hw_id: u32) -> Option<usize> {
        self.procs.iter().find(|p| p.hw_id == hw_id).map(|p| p.id)
    }
}

/// Build the processor table from the firmware descriptor list.
///
/// Two passes over the descriptors: the first sizes the table so it can be
/// allocated exactly once, the second fills it in iteration order, assigning
/// dense kernel ids from 0. The descriptor list is variable-length with
/// interleaved record types, so sizing up front is what keeps the indices
/// stable for the lifetime of the kernel.
///
/// # Panics
///
/// A descriptor list with no local APICs, or one whose contents change
/// between the passes, means the firmware tables are unusable; both are
/// fatal.
pub fn enumerate<F, I>(entries: F) -> ProcessorTable
where
    F: Fn() -> I,
    I: Iterator<Item = MadtEntry>,
{
    // Count pass.
    let count = entries()
        .filter(|e| matches!(e, MadtEntry::LocalApic { .. }))
        .count();
    if count == 0 {
        panic!("MADT lists no local APICs; at least the boot processor must be present");
    }
    assert!(
        count <= MAX_CPUS,
        "MADT lists {} processors, more than the supported {}",
        count,
        MAX_CPUS
    );

    // Fill pass.
    let mut procs = Vec::with_capacity(count);
    for entry in entries() {
        if let MadtEntry::LocalApic {
            processor_uid,
            apic_id,
            flags,
        } = entry
        {
            assert!(procs.len() < count, "MADT changed during enumeration");
            let id = procs.len();
            klog!(
                Trace,
                "SMP: processor {} has local APIC id {} (ACPI uid {})",
                id,
                apic_id,
                processor_uid
            );
            procs.push(Processor {
                id,
                hw_id: apic_id as u32,
                running: AtomicBool::new(false),
                arch: ArchCpuData {
                    acpi_uid: processor_uid,
                    lapic_flags: flags,
                },
            });
        }
    }
    assert!(procs.len() == count, "MADT changed during enumeration");

    ProcessorTable {
        procs: procs.into_boxed_slice(),
    }
}

// ============================================================================
// Global Table
// ============================================================================

/// The boot-time singleton. Published once by `mp_init`, never torn down.
static PROCESSORS: Once<ProcessorTable> = Once::new();

/// Publish the enumerated table and return the `'static` reference to it.
pub(crate) fn publish(table: ProcessorTable) -> &'static ProcessorTable {
    PROCESSORS.call_once(|| table)
}

/// The published table, or `None` before enumeration.
pub fn table() -> Option<&'static ProcessorTable> {
    PROCESSORS.get()
}

/// Number of known processors.
///
/// Before enumeration there is exactly one processor doing anything — the
/// bootstrap processor — so the pre-init answer is 1.
pub fn count() -> usize {
    PROCESSORS.get().map_or(1, |t| t.count())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim;
    use std::cell::Cell;
    use std::vec::Vec;

    #[test]
    fn test_enumeration_is_dense_and_ordered() {
        let table = enumerate(|| sim::lapics(&[0, 1, 3, 7]));
        assert_eq!(table.count(), 4);
        let hw: Vec<u32> = table.iter().map(|p| p.hw_id()).collect();
        assert_eq!(hw, [0, 1, 3, 7]);
        for (i, p) in table.iter().enumerate() {
            assert_eq!(p.id(), i);
            assert!(!p.is_running());
        }
    }

    #[test]
    fn test_non_lapic_entries_are_skipped() {
        let table = enumerate(|| sim::lapics_with_noise(&[2, 5]));
        assert_eq!(table.count(), 2);
        assert_eq!(table.get(0).hw_id(), 2);
        assert_eq!(table.get(1).hw_id(), 5);
    }

    #[test]
    #[should_panic(expected = "no local APICs")]
    fn test_empty_madt_is_fatal() {
        enumerate(|| sim::lapics(&[]));
    }

    #[test]
    #[should_panic(expected = "changed during enumeration")]
    fn test_table_shrinking_between_passes_is_fatal() {
        let pass = Cell::new(0);
        enumerate(|| {
            let n = pass.get();
            pass.set(n + 1);
            // First pass sees two processors, the second only one.
            if n == 0 {
                sim::lapics(&[0, 1])
            } else {
                sim::lapics(&[0])
            }
        });
    }

    #[test]
    fn test_hw_id_lookup() {
        let table = enumerate(|| sim::lapics(&[4, 9, 12]));
        assert_eq!(table.id_for_hw(4), Some(0));
        assert_eq!(table.id_for_hw(12), Some(2));
        assert_eq!(table.id_for_hw(7), None);
    }

    #[test]
    fn test_running_latch() {
        let table = enumerate(|| sim::lapics(&[0, 1]));
        assert!(!table.get(1).is_running());
        table.mark_running(1);
        assert!(table.get(1).is_running());
        // There is no way back down; marking again is idempotent.
        table.mark_running(1);
        assert!(table.get(1).is_running());
    }
}

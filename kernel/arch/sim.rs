//! Test doubles for the hardware seams.
//!
//! These stand in for the interrupt controller, the timebase, and the
//! firmware descriptor list so the bring-up and signalling logic can be
//! exercised on a host.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::boxed::Box;
use std::sync::Mutex as StdMutex;
use std::vec::Vec;

use crate::acpi::{LocalApicFlags, MadtEntry};
use crate::apic::{InterruptController, IpiKind, IpiShorthand};
use crate::hpet::Timebase;

/// One recorded `send_ipi` call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SentIpi {
    pub hw_id: u32,
    pub shorthand: IpiShorthand,
    pub kind: IpiKind,
    pub vector: u8,
    pub wait: bool,
}

/// Recording controller with a settable local hardware id and an optional
/// hook that models what the target does when a STARTUP IPI lands.
pub(crate) struct MockController<'a> {
    pub local_id: AtomicU32,
    pub sent: StdMutex<Vec<SentIpi>>,
    on_startup: Option<Box<dyn Fn(u32) + Send + Sync + 'a>>,
}

impl<'a> MockController<'a> {
    pub fn new(local_id: u32) -> Self {
        MockController {
            local_id: AtomicU32::new(local_id),
            sent: StdMutex::new(Vec::new()),
            on_startup: None,
        }
    }

    pub fn with_startup(
        local_id: u32,
        on_startup: impl Fn(u32) + Send + Sync + 'a,
    ) -> Self {
        MockController {
            local_id: AtomicU32::new(local_id),
            sent: StdMutex::new(Vec::new()),
            on_startup: Some(Box::new(on_startup)),
        }
    }
}

impl InterruptController for MockController<'_> {
    fn local_hw_id(&self) -> u32 {
        self.local_id.load(Ordering::Relaxed)
    }

    fn send_ipi(
        &self,
        hw_id: u32,
        shorthand: IpiShorthand,
        kind: IpiKind,
        vector: u8,
        wait_for_delivery: bool,
    ) {
        self.sent.lock().unwrap().push(SentIpi {
            hw_id,
            shorthand,
            kind,
            vector,
            wait: wait_for_delivery,
        });
        if kind == IpiKind::Startup {
            if let Some(hook) = &self.on_startup {
                hook(hw_id);
            }
        }
    }

    fn init_local(&self) {}
    fn init_global(&self, _cpus: usize) {}
}

/// Controller that swallows everything; for tests where delivery is modelled
/// by a polling thread instead.
pub(crate) struct NoopController;

impl InterruptController for NoopController {
    fn local_hw_id(&self) -> u32 {
        0
    }
    fn send_ipi(&self, _: u32, _: IpiShorthand, _: IpiKind, _: u8, _: bool) {}
    fn init_local(&self) {}
    fn init_global(&self, _cpus: usize) {}
}

/// Synthetic clock: one tick per simulated microsecond. Time advances a tick
/// per observation and by the full amount on `busy_wait`, so bounded polls
/// terminate without wall-clock delays.
pub(crate) struct MockClock {
    ticks: AtomicU64,
}

impl MockClock {
    pub fn new() -> Self {
        MockClock {
            ticks: AtomicU64::new(0),
        }
    }
}

impl Timebase for MockClock {
    fn now(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed)
    }

    fn ticks_for(&self, nanoseconds: u64) -> u64 {
        nanoseconds / 1_000
    }

    fn busy_wait(&self, nanoseconds: u64) {
        self.ticks
            .fetch_add(nanoseconds / 1_000, Ordering::Relaxed);
    }
}

/// A descriptor list with one local APIC per id, in order.
pub(crate) fn lapics(ids: &[u8]) -> std::vec::IntoIter<MadtEntry> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| MadtEntry::LocalApic {
            processor_uid: i as u8,
            apic_id: *id,
            flags: LocalApicFlags::ENABLED,
        })
        .collect::<Vec<_>>()
        .into_iter()
}

/// Like [`lapics`], but with non-processor records interleaved the way real
/// firmware tables have I/O APIC and override entries mixed in.
pub(crate) fn lapics_with_noise(ids: &[u8]) -> std::vec::IntoIter<MadtEntry> {
    let mut entries = alloc::vec![MadtEntry::Other { entry_type: 1 }];
    for (i, id) in ids.iter().enumerate() {
        entries.push(MadtEntry::LocalApic {
            processor_uid: i as u8,
            apic_id: *id,
            flags: LocalApicFlags::ENABLED,
        });
        entries.push(MadtEntry::Other { entry_type: 2 });
    }
    entries.into_iter()
}

//! Multi-processor bring-up.
//!
//! The bootstrap processor discovers every logical processor from the
//! firmware tables, stages the real-mode trampoline, and walks the table
//! waking each application processor with the INIT / STARTUP sequence the
//! hardware requires: INIT resets the target into wait-for-SIPI, a 10 ms
//! wall-clock gap lets it settle, and the STARTUP IPI hands it the
//! trampoline page. APs are woken one at a time — the shared trampoline
//! page then has a single reader, and a failure is attributable to exactly
//! one processor.
//!
//! Each AP lands in [`ap_entry`], finishes its CPU-local init, and publishes
//! its `running` flag with release ordering; the BSP's bounded poll on that
//! flag is therefore also proof that the AP's init completed.

use core::sync::atomic::{AtomicBool, Ordering};
use spin::Once;

use crate::apic::{self, InterruptController, IpiKind, IpiShorthand};
use crate::hpet::{self, Timebase};
use crate::processor::{self, ProcessorTable};
use crate::{acpi, cpu, gdt, interrupts, ipi, trampoline};

/// Wall-clock gap between the INIT and STARTUP IPIs.
const AP_INIT_GAP_NS: u64 = 10_000_000; // 10 ms

/// How long the sequencer waits for a woken AP to publish `running`.
const AP_START_TIMEOUT_NS: u64 = 1_000_000_000; // 1 s

/// How long an onboarded AP waits for the scheduler before giving up.
const SCHEDULER_WAIT_NS: u64 = 2_000_000_000; // 2 s

// ============================================================================
// Platform Hooks
// ============================================================================

/// The hardware implementations behind the controller and timer seams,
/// installed once by `mp_init`.
struct Platform {
    intc: &'static dyn InterruptController,
    timer: &'static dyn Timebase,
}

static PLATFORM: Once<Platform> = Once::new();

pub(crate) fn controller() -> &'static dyn InterruptController {
    PLATFORM
        .get()
        .unwrap_or_else(|| panic!("platform hooks not installed"))
        .intc
}

pub(crate) fn timebase() -> &'static dyn Timebase {
    PLATFORM
        .get()
        .unwrap_or_else(|| panic!("platform hooks not installed"))
        .timer
}

// ============================================================================
// Scheduler Hand-off
// ============================================================================

/// Latched by the kernel once the scheduler can take over the idle CPUs.
static SCHEDULER_ONLINE: AtomicBool = AtomicBool::new(false);

/// Announce that the scheduler is ready; releases every AP parked in its
/// post-onboarding wait.
pub fn mark_scheduler_online() {
    SCHEDULER_ONLINE.store(true, Ordering::Release);
}

fn scheduler_online() -> bool {
    SCHEDULER_ONLINE.load(Ordering::Acquire)
}

// ============================================================================
// Public API
// ============================================================================

/// One-shot BSP entry: enumerate processors, wake every AP, and return once
/// all of them are running.
///
/// Preconditions: the BSP's GDT/IDT are loaded (the IDT's NMI entry is the
/// signal channel's receive path), the HPET is initialised, and interrupts
/// are still disabled. Interrupts are enabled on the way out.
pub fn mp_init() {
    assert!(
        processor::table().is_none(),
        "mp_init called more than once"
    );

    PLATFORM.call_once(|| Platform {
        intc: &apic::LOCAL_APIC,
        timer: &hpet::HPET_CLOCK,
    });
    let intc = controller();
    let timer = timebase();

    let table = processor::enumerate(|| {
        acpi::madt_entries().unwrap_or_else(|| panic!("MADT not found or failed validation"))
    });
    klog_always!("SMP: firmware reports {} processor(s)", table.count());

    // Interrupt controllers first: the STARTUP handshake and the signal
    // channel both go through them.
    intc.init_global(table.count());
    intc.init_local();

    // Slots and table must be globally visible before any AP runs; the AP
    // onboarding path reads both.
    ipi::init_slots(table.count());
    let table = processor::publish(table);

    unsafe { trampoline::stage(ap_entry) };

    bring_up_secondaries(table, intc, timer, &mut trampoline::prepare_ap);

    klog_always!("SMP: all {} processor(s) running", table.count());

    // Every controller the BSP needs is live; open the gate.
    interrupts::enable();
}

/// Kernel id of the executing processor.
///
/// Before enumeration there is only one processor, so the answer is 0 — this
/// is what defines the BSP's identity during early init. After enumeration a
/// hardware id that is missing from the table means the table and the
/// machine disagree, which is unrecoverable.
pub fn this_processor_id() -> usize {
    match processor::table() {
        None => 0,
        Some(table) => {
            let hw = controller().local_hw_id();
            table
                .id_for_hw(hw)
                .unwrap_or_else(|| panic!("hw id {} not present in the processor table", hw))
        }
    }
}

// ============================================================================
// Boot Sequencer
// ============================================================================

/// Wake every processor in the table that is not the executing one, in table
/// order, and wait for each to publish `running`.
///
/// `stage_ap` runs immediately before each wake to put that AP's boot state
/// (stack, mailbox words) in place.
fn bring_up_secondaries(
    table: &ProcessorTable,
    intc: &dyn InterruptController,
    timer: &dyn Timebase,
    stage_ap: &mut dyn FnMut(usize),
) {
    let self_hw = intc.local_hw_id();
    let window = timer.ticks_for(AP_START_TIMEOUT_NS);

    for proc in table.iter() {
        let cpu = proc.id();
        if proc.hw_id() == self_hw {
            // The executing processor is running by definition.
            table.mark_running(cpu);
            continue;
        }

        stage_ap(cpu);

        klog!(Info, "SMP: waking CPU {} (hw id {})", cpu, proc.hw_id());
        intc.send_ipi(proc.hw_id(), IpiShorthand::None, IpiKind::Init, 0, true);
        timer.busy_wait(AP_INIT_GAP_NS);
        intc.send_ipi(
            proc.hw_id(),
            IpiShorthand::None,
            IpiKind::Startup,
            trampoline::startup_vector(),
            true,
        );

        let start = timer.now();
        while timer.now().wrapping_sub(start) < window && !proc.is_running() {
            core::hint::spin_loop();
        }
        if !proc.is_running() {
            panic!(
                "SMP: CPU {} (hw id {}) did not come online within 1s",
                cpu,
                proc.hw_id()
            );
        }
    }
}

// ============================================================================
// AP Onboarding
// ============================================================================

/// Entry point for application processors, reached from the trampoline's
/// long-mode stub. Completes CPU-local init, announces `running`, and parks
/// until the scheduler takes over.
pub extern "C" fn ap_entry() -> ! {
    // Nothing runs threads here yet; make sure an early exception cannot
    // be attributed to one.
    cpu::clear_kernel_gs_base();

    let cpu = this_processor_id();
    assert!(cpu != 0, "AP entry executed on the bootstrap processor");

    // Descriptor tables: the shared IDT (whose NMI entry is the signal
    // receive path) and this CPU's GDT/TSS.
    interrupts::load_for_ap();
    unsafe { gdt::init_for_ap(cpu, trampoline::ap_stack_top(cpu)) };

    // CPU-local features.
    cpu::init_pat();
    unsafe { cpu::init_syscall_msrs() };
    cpu::enable_fp();

    // Local interrupt controller.
    controller().init_local();

    // Publish `running` last: the release store orders every init above
    // before the BSP's acquire poll can observe `true`.
    processor::table()
        .unwrap_or_else(|| panic!("AP running before processor enumeration"))
        .mark_running(cpu);

    interrupts::enable();

    // Wait for the scheduler hand-off; a kernel that never brings one up
    // has hung, and the AP says so rather than spinning silently forever.
    let timer = timebase();
    let deadline = timer.ticks_for(SCHEDULER_WAIT_NS);
    let start = timer.now();
    while !scheduler_online() {
        if timer.now().wrapping_sub(start) >= deadline {
            panic!("CPU {}: no scheduler arrived within 2s of onboarding", cpu);
        }
        core::hint::spin_loop();
    }

    klog!(Info, "SMP: CPU {} idle, waiting for work", cpu);
    idle_loop(cpu)
}

/// Per-CPU idle. NMIs are serviced even while halted, so a parked CPU keeps
/// answering signals; a latched `Suspend` just keeps it here.
fn idle_loop(cpu: usize) -> ! {
    loop {
        while ipi::halt_requested(cpu) {
            x86_64::instructions::hlt();
        }
        x86_64::instructions::hlt();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::enumerate;
    use crate::sim::{self, MockClock, MockController};
    use crate::trampoline::startup_vector;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::vec::Vec;

    #[test]
    fn test_sequencer_wakes_each_ap_in_order() {
        let table = enumerate(|| sim::lapics(&[0, 1, 3, 7]));
        let intc = MockController::with_startup(0, |hw| {
            let cpu = table.id_for_hw(hw).unwrap();
            table.mark_running(cpu);
        });
        let clock = MockClock::new();
        let mut staged: Vec<usize> = Vec::new();

        bring_up_secondaries(&table, &intc, &clock, &mut |cpu| staged.push(cpu));

        // Every processor ends up running, the BSP by self-marking.
        for proc in table.iter() {
            assert!(proc.is_running());
        }
        // Each AP was staged exactly once, in table order, before its wake.
        assert_eq!(staged, [1, 2, 3]);

        // One INIT + STARTUP pair per AP, in table order, both waited-for,
        // with the trampoline page in the STARTUP vector.
        let sent = intc.sent.lock().unwrap();
        assert_eq!(sent.len(), 6);
        let expected_hw = [1u32, 1, 3, 3, 7, 7];
        for (i, ipi) in sent.iter().enumerate() {
            assert_eq!(ipi.hw_id, expected_hw[i]);
            assert_eq!(ipi.shorthand, crate::apic::IpiShorthand::None);
            assert!(ipi.wait);
            if i % 2 == 0 {
                assert_eq!(ipi.kind, crate::apic::IpiKind::Init);
            } else {
                assert_eq!(ipi.kind, crate::apic::IpiKind::Startup);
                assert_eq!(ipi.vector, startup_vector());
            }
        }
    }

    #[test]
    fn test_single_processor_sends_no_ipis() {
        let table = enumerate(|| sim::lapics(&[5]));
        let intc = MockController::new(5);
        let clock = MockClock::new();

        bring_up_secondaries(&table, &intc, &clock, &mut |_| {
            panic!("staged an AP on a single-processor system")
        });

        assert!(table.get(0).is_running());
        assert!(intc.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_ap_start_timeout_is_fatal_after_one_init_startup_pair() {
        let table = enumerate(|| sim::lapics(&[0, 1]));
        // No startup hook: the AP never publishes `running`.
        let intc = MockController::new(0);
        let clock = MockClock::new();

        let result = catch_unwind(AssertUnwindSafe(|| {
            bring_up_secondaries(&table, &intc, &clock, &mut |_| {});
        }));
        assert!(result.is_err());

        // Exactly one INIT and one STARTUP went to the dead AP; no retries.
        let sent = intc.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, crate::apic::IpiKind::Init);
        assert_eq!(sent[0].hw_id, 1);
        assert_eq!(sent[1].kind, crate::apic::IpiKind::Startup);
        assert_eq!(sent[1].hw_id, 1);
    }

    #[test]
    fn test_sequencer_skips_executing_processor_anywhere_in_table() {
        // The executing CPU need not be first in firmware order.
        let table = enumerate(|| sim::lapics(&[4, 2, 9]));
        let intc = MockController::with_startup(2, |hw| {
            let cpu = table.id_for_hw(hw).unwrap();
            table.mark_running(cpu);
        });
        let clock = MockClock::new();

        bring_up_secondaries(&table, &intc, &clock, &mut |_| {});

        for proc in table.iter() {
            assert!(proc.is_running());
        }
        let sent = intc.sent.lock().unwrap();
        let woken: Vec<u32> = sent.iter().map(|s| s.hw_id).collect();
        assert_eq!(woken, [4, 4, 9, 9]);
    }

    #[test]
    fn test_poll_window_is_bounded_by_timeout() {
        // The failing poll must consume the whole 1 s window on the mock
        // clock, and not an unbounded amount.
        let table = enumerate(|| sim::lapics(&[0, 1]));
        let intc = MockController::new(0);
        let clock = MockClock::new();

        let before = clock.now();
        let _ = catch_unwind(AssertUnwindSafe(|| {
            bring_up_secondaries(&table, &intc, &clock, &mut |_| {});
        }));
        let after = clock.now();

        let window = clock.ticks_for(AP_START_TIMEOUT_NS);
        let elapsed = after - before;
        assert!(elapsed >= window);
        // Window plus the 10 ms gap plus per-observation ticks; nowhere near
        // a second window.
        assert!(elapsed < 2 * window);
    }
}

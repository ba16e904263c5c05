//! Inter-processor signalling over NMI.
//!
//! x86 cannot attach a payload to an IPI delivered as NMI, so the message
//! body lives in shared memory: one signal slot per target processor. The
//! NMI is nothing but a doorbell; the slot's `state` word is what carries the
//! handshake:
//!
//! ```text
//! IDLE --(sender posts)--> POSTED --(target handles)--> ACKED --(sender clears)--> IDLE
//! ```
//!
//! Senders to the same target serialise on the slot's send lock; senders to
//! different targets share nothing. NMI is used (rather than a fixed vector)
//! because delivery must work against a target that is holding locks with
//! interrupts disabled — a TLB shootdown cannot wait for `sti`.
//!
//! # Memory ordering
//!
//! - The sender writes the payload relaxed, then publishes `POSTED` with a
//!   release store; the target's acquire load of `POSTED` therefore sees the
//!   payload.
//! - The target publishes `ACKED` with a release store after dispatching; the
//!   sender's acquire load of `ACKED` sees everything the handler did.
//! - Between `POSTED` and `ACKED` the payload is stable: only the sender
//!   writes it, and only while it holds the send lock on an `IDLE` slot.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use spin::{Mutex, Once};

use crate::apic::{InterruptController, IpiKind, IpiShorthand};
use crate::processor::{self, MAX_CPUS};
use crate::smp;

// ============================================================================
// Messages
// ============================================================================

/// The closed set of cross-processor control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpiMessage {
    /// Resume a processor previously told to suspend.
    Resume = 0,
    /// Park the target in its idle loop until a `Resume` arrives.
    Suspend = 1,
    /// The target must reload its address translation state.
    TlbShootdown = 2,
}

impl IpiMessage {
    /// Decode a raw payload byte.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(IpiMessage::Resume),
            1 => Some(IpiMessage::Suspend),
            2 => Some(IpiMessage::TlbShootdown),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IpiMessage::Resume => "RESUME",
            IpiMessage::Suspend => "SUSPEND",
            IpiMessage::TlbShootdown => "TLB_SHOOTDOWN",
        }
    }
}

// ============================================================================
// Signal Slots
// ============================================================================

/// Slot handshake states.
mod slot_state {
    /// No transaction in flight. Also what a target finds when an NMI was not
    /// generated by the kernel.
    pub const IDLE: u8 = 0;
    /// A message is posted and waiting for the target.
    pub const POSTED: u8 = 1;
    /// The target has dispatched the message; the sender may reclaim the slot.
    pub const ACKED: u8 = 2;
}

/// One per-target mailbox for the payload-less NMI channel.
pub(crate) struct SignalSlot {
    /// Message payload. Plain data, protected by the ordering on `state`;
    /// initialised to an arbitrary valid message so it is never undefined.
    pending: AtomicU8,
    /// Handshake word; see the module docs for the transition rules.
    state: AtomicU8,
    /// Serialises senders targeting this slot.
    send_lock: Mutex<()>,
}

impl SignalSlot {
    pub(crate) const fn new() -> Self {
        SignalSlot {
            pending: AtomicU8::new(IpiMessage::Suspend as u8),
            state: AtomicU8::new(slot_state::IDLE),
            send_lock: Mutex::new(()),
        }
    }

    /// Sender side: post `msg`, ring the target's NMI doorbell, and wait for
    /// the acknowledgement.
    ///
    /// Returns only after the target has dispatched the message. Panics if
    /// the slot is not `IDLE` under the send lock — that means a lost ACK or
    /// memory corruption, neither of which is recoverable.
    pub(crate) fn send(&self, msg: IpiMessage, target_hw: u32, intc: &dyn InterruptController) {
        let _guard = self.send_lock.lock();

        assert!(
            self.state.load(Ordering::Acquire) == slot_state::IDLE,
            "signal slot not idle under send lock"
        );

        self.pending.store(msg as u8, Ordering::Relaxed);
        self.state.store(slot_state::POSTED, Ordering::Release);

        intc.send_ipi(target_hw, IpiShorthand::None, IpiKind::Nmi, 0, false);

        while self.state.load(Ordering::Acquire) != slot_state::ACKED {
            core::hint::spin_loop();
        }

        self.state.store(slot_state::IDLE, Ordering::Release);
    }

    /// Target side: claim a posted message, dispatch it, acknowledge.
    ///
    /// Returns `false` without touching the slot when no message is posted —
    /// the NMI belongs to someone else (hardware, watchdog) and must fall
    /// through to the generic handler.
    pub(crate) fn receive(&self, dispatch: impl FnOnce(IpiMessage)) -> bool {
        if self.state.load(Ordering::Acquire) != slot_state::POSTED {
            return false;
        }

        let raw = self.pending.load(Ordering::Relaxed);
        let msg = IpiMessage::from_raw(raw)
            .unwrap_or_else(|| panic!("corrupt signal payload {:#x}", raw));
        dispatch(msg);

        self.state.store(slot_state::ACKED, Ordering::Release);
        true
    }
}

// ============================================================================
// Channel State
// ============================================================================

/// One slot per processor, sized by `mp_init` alongside the processor table.
static SLOTS: Once<Box<[SignalSlot]>> = Once::new();

/// Per-processor suspend latch, driven by `Suspend`/`Resume` messages and
/// honoured by the idle loops.
static HALT_REQUESTED: [AtomicBool; MAX_CPUS] = {
    const INIT: AtomicBool = AtomicBool::new(false);
    [INIT; MAX_CPUS]
};

/// Channel statistics.
static STAT_SENT: AtomicU64 = AtomicU64::new(0);
static STAT_DELIVERED: AtomicU64 = AtomicU64::new(0);

pub struct IpiStats {
    pub sent: u64,
    pub delivered: u64,
}

pub fn stats() -> IpiStats {
    IpiStats {
        sent: STAT_SENT.load(Ordering::Relaxed),
        delivered: STAT_DELIVERED.load(Ordering::Relaxed),
    }
}

/// Allocate the signal-slot array, one slot per processor.
pub(crate) fn init_slots(cpus: usize) {
    SLOTS.call_once(|| (0..cpus).map(|_| SignalSlot::new()).collect());
}

// ============================================================================
// Public API
// ============================================================================

/// Deliver `msg` to processor `target` and wait until it has been handled.
///
/// Callers targeting the same processor serialise; callers targeting
/// different processors proceed in parallel.
///
/// # Panics
///
/// Before `mp_init`, or with an out-of-range target: both indicate a caller
/// that cannot exist in a correct kernel.
pub fn signal(target: usize, msg: IpiMessage) {
    let table =
        processor::table().unwrap_or_else(|| panic!("signal() before processor enumeration"));
    let slots = SLOTS
        .get()
        .unwrap_or_else(|| panic!("signal() before slot initialisation"));
    assert!(
        target < table.count(),
        "signal target {} out of range ({} processors)",
        target,
        table.count()
    );

    klog!(
        Trace,
        "IPI: signalling processor {} with {}",
        target,
        msg.name()
    );
    STAT_SENT.fetch_add(1, Ordering::Relaxed);

    slots[target].send(msg, table.get(target).hw_id(), smp::controller());
}

/// NMI-handler hook: returns `true` if the NMI carried a kernel signal for
/// the executing processor, `false` if it should fall through to the generic
/// NMI path.
///
/// Before the channel exists no NMI can be ours.
pub fn on_signal_received() -> bool {
    let Some(_table) = processor::table() else {
        return false;
    };
    let Some(slots) = SLOTS.get() else {
        return false;
    };

    let cpu = smp::this_processor_id();
    let consumed = slots[cpu].receive(|msg| handle_message(cpu, msg));
    if consumed {
        STAT_DELIVERED.fetch_add(1, Ordering::Relaxed);
    }
    consumed
}

/// Whether a `Suspend` is pending for `cpu` (cleared by `Resume`).
pub fn halt_requested(cpu: usize) -> bool {
    HALT_REQUESTED[cpu].load(Ordering::Acquire)
}

/// Dispatch one received message on the executing processor.
fn handle_message(cpu: usize, msg: IpiMessage) {
    match msg {
        IpiMessage::Suspend => {
            HALT_REQUESTED[cpu].store(true, Ordering::Release);
        }
        IpiMessage::Resume => {
            HALT_REQUESTED[cpu].store(false, Ordering::Release);
        }
        IpiMessage::TlbShootdown => {
            // Reload CR3; flushes all non-global translations.
            x86_64::instructions::tlb::flush_all();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{MockController, NoopController};
    use core::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec;

    /// A controller whose NMI "delivery" runs the receive path inline, as if
    /// the target handled the doorbell instantly.
    struct LoopbackController<'a> {
        slot: &'a SignalSlot,
        log: StdMutex<Vec<IpiMessage>>,
    }

    impl crate::apic::InterruptController for LoopbackController<'_> {
        fn local_hw_id(&self) -> u32 {
            0
        }
        fn send_ipi(
            &self,
            _hw_id: u32,
            _shorthand: IpiShorthand,
            kind: IpiKind,
            _vector: u8,
            _wait: bool,
        ) {
            assert_eq!(kind, IpiKind::Nmi);
            let consumed = self.slot.receive(|m| self.log.lock().unwrap().push(m));
            assert!(consumed);
        }
        fn init_local(&self) {}
        fn init_global(&self, _cpus: usize) {}
    }

    #[test]
    fn test_roundtrip_returns_after_ack() {
        let slot = SignalSlot::new();
        let intc = LoopbackController {
            slot: &slot,
            log: StdMutex::new(Vec::new()),
        };
        slot.send(IpiMessage::TlbShootdown, 3, &intc);
        assert_eq!(*intc.log.lock().unwrap(), [IpiMessage::TlbShootdown]);
        // The transaction is fully retired; the slot is reusable.
        assert_eq!(slot.state.load(Ordering::Acquire), slot_state::IDLE);
        slot.send(IpiMessage::Resume, 3, &intc);
        assert_eq!(
            *intc.log.lock().unwrap(),
            [IpiMessage::TlbShootdown, IpiMessage::Resume]
        );
    }

    #[test]
    fn test_stray_nmi_is_not_consumed() {
        let slot = SignalSlot::new();
        let consumed = slot.receive(|_| panic!("dispatched a message that was never posted"));
        assert!(!consumed);
        assert_eq!(slot.state.load(Ordering::Acquire), slot_state::IDLE);
    }

    #[test]
    #[should_panic(expected = "not idle")]
    fn test_non_idle_slot_under_send_lock_is_fatal() {
        let slot = SignalSlot::new();
        // Simulate a lost ACK: the state machine says this cannot happen, so
        // the sender must treat it as corruption.
        slot.state.store(slot_state::POSTED, Ordering::Release);
        slot.send(IpiMessage::Resume, 0, &NoopController);
    }

    #[test]
    fn test_concurrent_senders_serialise_per_target() {
        const PER_SENDER: usize = 25;
        let slot = SignalSlot::new();
        let log: StdMutex<Vec<IpiMessage>> = StdMutex::new(Vec::new());
        let done = AtomicBool::new(false);

        let send_n = |msg: IpiMessage| {
            for _ in 0..PER_SENDER {
                slot.send(msg, 7, &NoopController);
            }
        };

        std::thread::scope(|s| {
            // The target: polls its slot the way the NMI handler would.
            s.spawn(|| loop {
                let got = slot.receive(|m| log.lock().unwrap().push(m));
                if !got && done.load(Ordering::Acquire) {
                    break;
                }
                std::hint::spin_loop();
            });

            let senders = [
                s.spawn(|| send_n(IpiMessage::Resume)),
                s.spawn(|| send_n(IpiMessage::Suspend)),
                s.spawn(|| send_n(IpiMessage::TlbShootdown)),
            ];
            for h in senders {
                h.join().unwrap();
            }
            // Every send has returned, so nothing is left in flight; the
            // target drains and exits.
            done.store(true, Ordering::Release);
        });
        let log = log.into_inner().unwrap();

        assert_eq!(log.len(), 3 * PER_SENDER);
        for msg in [
            IpiMessage::Resume,
            IpiMessage::Suspend,
            IpiMessage::TlbShootdown,
        ] {
            assert_eq!(log.iter().filter(|m| **m == msg).count(), PER_SENDER);
        }
    }

    #[test]
    fn test_target_dispatches_in_send_order() {
        let slot = SignalSlot::new();
        let log: StdMutex<Vec<IpiMessage>> = StdMutex::new(Vec::new());
        let done = AtomicBool::new(false);

        let sequence: Vec<IpiMessage> = [
            IpiMessage::Resume,
            IpiMessage::Suspend,
            IpiMessage::TlbShootdown,
        ]
        .into_iter()
        .cycle()
        .take(30)
        .collect();

        std::thread::scope(|s| {
            s.spawn(|| loop {
                let got = slot.receive(|m| log.lock().unwrap().push(m));
                if !got && done.load(Ordering::Acquire) {
                    break;
                }
                std::hint::spin_loop();
            });

            // A single sender's calls linearise trivially; each send returns
            // only after its dispatch, so the log must match exactly.
            for msg in &sequence {
                slot.send(*msg, 2, &NoopController);
            }
            done.store(true, Ordering::Release);
        });

        assert_eq!(*log.lock().unwrap(), sequence);
    }

    #[test]
    fn test_independent_targets_do_not_serialise() {
        let slot_a = SignalSlot::new();
        let slot_b = SignalSlot::new();
        let log_b: StdMutex<Vec<IpiMessage>> = StdMutex::new(Vec::new());
        let b_done = AtomicBool::new(false);

        std::thread::scope(|s| {
            // Sender to target A: parks mid-transaction, since nothing acks
            // slot A yet.
            let a_sender = s.spawn(|| {
                slot_a.send(IpiMessage::Suspend, 0, &NoopController);
            });

            // Target B acks promptly.
            s.spawn(|| {
                while !b_done.load(Ordering::Acquire) {
                    slot_b.receive(|m| log_b.lock().unwrap().push(m));
                    std::hint::spin_loop();
                }
            });

            // While A's transaction is in flight, B completes. If the two
            // slots shared any lock this send would never return.
            slot_b.send(IpiMessage::Resume, 1, &NoopController);
            b_done.store(true, Ordering::Release);
            assert_eq!(*log_b.lock().unwrap(), [IpiMessage::Resume]);
            assert!(!a_sender.is_finished());

            // Now ack A so the scope can join its sender.
            s.spawn(|| {
                while !slot_a.receive(|_| {}) {
                    std::hint::spin_loop();
                }
            });
        });
    }

    #[test]
    fn test_message_raw_roundtrip() {
        for msg in [
            IpiMessage::Resume,
            IpiMessage::Suspend,
            IpiMessage::TlbShootdown,
        ] {
            assert_eq!(IpiMessage::from_raw(msg as u8), Some(msg));
        }
        assert_eq!(IpiMessage::from_raw(0x7F), None);
    }

    #[test]
    fn test_nmi_doorbell_parameters() {
        // The doorbell must be a no-shorthand NMI that does not wait for
        // delivery; the handshake word is what provides completion.
        let slot = SignalSlot::new();
        let intc = MockController::new(0);
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    slot.receive(|_| {});
                    std::hint::spin_loop();
                }
            });
            slot.send(IpiMessage::Resume, 9, &intc);
            done.store(true, Ordering::Release);
        });

        let sent = intc.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].hw_id, 9);
        assert_eq!(sent[0].kind, IpiKind::Nmi);
        assert_eq!(sent[0].shorthand, IpiShorthand::None);
        assert!(!sent[0].wait);
    }
}

//! Per-CPU global descriptor tables and task state segments.
//!
//! Every CPU gets its own TSS (the TSS is marked busy by `ltr`, so it cannot
//! be shared) and therefore its own GDT, since the TSS descriptor embeds the
//! TSS address. Segment selector values come out identical on every CPU,
//! which is what lets the SYSCALL MSRs and the IDT be configured once.

use core::sync::atomic::{AtomicBool, Ordering};
use spin::Once;
use x86_64::{
    instructions::tables::load_tss,
    registers::segmentation::{Segment, CS, DS, SS},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

use crate::processor::MAX_CPUS;

/// IST index used by the double-fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Privilege-stack slot used for ring 3 -> ring 0 transitions.
const KERNEL_PRIVILEGE_STACK_INDEX: usize = 0;

/// BSP kernel stack size (64 KiB).
pub const KERNEL_STACK_SIZE: usize = 16 * 4096;

/// Double-fault IST stack size (32 KiB).
pub const DOUBLE_FAULT_STACK_SIZE: usize = 8 * 4096;

/// 16-byte aligned stack storage.
#[repr(C, align(16))]
struct AlignedStack<const SIZE: usize>([u8; SIZE]);

/// BSP kernel privilege stack.
static mut BSP_KERNEL_STACK: AlignedStack<KERNEL_STACK_SIZE> = AlignedStack([0; KERNEL_STACK_SIZE]);

/// BSP double-fault stack; a separate stack keeps a kernel stack overflow
/// from escalating into a triple fault.
static mut BSP_DOUBLE_FAULT_STACK: AlignedStack<DOUBLE_FAULT_STACK_SIZE> =
    AlignedStack([0; DOUBLE_FAULT_STACK_SIZE]);

/// Segment selector set. Identical values on every CPU.
#[derive(Debug, Clone, Copy)]
pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub user_data: SegmentSelector,
    pub tss: SegmentSelector,
}

/// Per-CPU TSS storage.
static mut PER_CPU_TSS: [TaskStateSegment; MAX_CPUS] = {
    const INIT: TaskStateSegment = TaskStateSegment::new();
    [INIT; MAX_CPUS]
};

/// Per-CPU GDT storage; each entry's TSS descriptor points at that CPU's TSS.
static mut PER_CPU_GDT: [Option<(GlobalDescriptorTable, Selectors)>; MAX_CPUS] = {
    const INIT: Option<(GlobalDescriptorTable, Selectors)> = None;
    [INIT; MAX_CPUS]
};

/// Per-CPU initialisation flags.
static PER_CPU_INIT: [AtomicBool; MAX_CPUS] = {
    const INIT: AtomicBool = AtomicBool::new(false);
    [INIT; MAX_CPUS]
};

/// Selector cache, filled on first init.
static SELECTORS_CACHE: Once<Selectors> = Once::new();

/// Build the TSS and GDT for one CPU.
///
/// # Safety
///
/// Must run exactly once per CPU; `kernel_stack_top` and `df_stack_top` must
/// be valid stack tops.
unsafe fn init_per_cpu_gdt(cpu_id: usize, kernel_stack_top: u64, df_stack_top: u64) {
    if cpu_id >= MAX_CPUS {
        panic!("CPU id {} exceeds MAX_CPUS {}", cpu_id, MAX_CPUS);
    }

    let tss = &mut PER_CPU_TSS[cpu_id];
    tss.privilege_stack_table[KERNEL_PRIVILEGE_STACK_INDEX] = VirtAddr::new(kernel_stack_top);
    tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = VirtAddr::new(df_stack_top);

    let mut gdt = GlobalDescriptorTable::new();
    let kernel_code = gdt.append(Descriptor::kernel_code_segment());
    let kernel_data = gdt.append(Descriptor::kernel_data_segment());
    let user_data = gdt.append(Descriptor::user_data_segment());
    let user_code = gdt.append(Descriptor::user_code_segment());
    let tss_selector = gdt.append(Descriptor::tss_segment(&PER_CPU_TSS[cpu_id]));

    let selectors = Selectors {
        kernel_code,
        kernel_data,
        user_code,
        user_data,
        tss: tss_selector,
    };

    PER_CPU_GDT[cpu_id] = Some((gdt, selectors));
    SELECTORS_CACHE.call_once(|| selectors);
    PER_CPU_INIT[cpu_id].store(true, Ordering::Release);
}

/// Load the GDT and TSS built for `cpu_id` on the executing CPU.
///
/// # Safety
///
/// `init_per_cpu_gdt(cpu_id, ..)` must have completed.
unsafe fn load_per_cpu_gdt(cpu_id: usize) {
    if !PER_CPU_INIT[cpu_id].load(Ordering::Acquire) {
        panic!("per-CPU GDT not initialised for CPU {}", cpu_id);
    }

    let (gdt, selectors) = PER_CPU_GDT[cpu_id].as_ref().unwrap();
    gdt.load();
    CS::set_reg(selectors.kernel_code);
    DS::set_reg(selectors.kernel_data);
    SS::set_reg(selectors.kernel_data);
    load_tss(selectors.tss);
}

/// Initialise and load the BSP's GDT and TSS. Must run before interrupts are
/// enabled.
pub fn init() {
    let kernel_stack_top = {
        let stack_start = VirtAddr::from_ptr(unsafe { &raw const BSP_KERNEL_STACK.0 });
        (stack_start + KERNEL_STACK_SIZE as u64).as_u64()
    };
    let df_stack_top = {
        let stack_start = VirtAddr::from_ptr(unsafe { &raw const BSP_DOUBLE_FAULT_STACK.0 });
        (stack_start + DOUBLE_FAULT_STACK_SIZE as u64).as_u64()
    };

    unsafe {
        init_per_cpu_gdt(0, kernel_stack_top, df_stack_top);
        load_per_cpu_gdt(0);
    }
}

/// The selector set shared by every CPU.
pub fn selectors() -> &'static Selectors {
    SELECTORS_CACHE
        .get()
        .unwrap_or_else(|| panic!("GDT not initialised"))
}

/// Initialise and load the GDT and TSS for an application processor.
///
/// # Arguments
///
/// * `cpu_id` - Kernel id of this AP.
/// * `kernel_stack_top` - This AP's kernel stack top.
///
/// # Safety
///
/// Once per AP, from its own onboarding path, before it can take interrupts.
pub unsafe fn init_for_ap(cpu_id: usize, kernel_stack_top: u64) {
    if cpu_id == 0 {
        panic!("init_for_ap called for the BSP");
    }

    // APs reuse their kernel stack for the double-fault IST.
    let df_stack_top = kernel_stack_top;

    init_per_cpu_gdt(cpu_id, kernel_stack_top, df_stack_top);
    load_per_cpu_gdt(cpu_id);
}

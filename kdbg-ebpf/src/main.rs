//! # eBPF Kernel-Side Probes
//!
//! Probes that run inside the Linux kernel on entry to and return from the
//! kernel functions userspace attached them to.
//!
//! ## Programs
//!
//! - **Kprobe**: `function_entry` - entry / breakpoint-hit events with registers
//! - **Kretprobe**: `function_exit` - exit events with the return value
//!
//! ## Maps (Shared with Userspace)
//!
//! - `EVENTS` - Ring buffer (4MB) for the event stream
//! - `CONTROL` - Master switch, PID filter, debug mode (single entry)
//! - `BREAKPOINTS` - Enabled breakpoint addresses
//! - `PROBE_SYMBOLS` - Function address → name, filled at attach time
//! - `ENTRY_IPS` - Thread → function entered last (pairs exits with entries)
//! - `EVENT_COUNTERS` - Per-CPU emitted / dropped / filtered counters
//!
//! ## Build
//!
//! Always compiled in release mode:
//! ```bash
//! cargo xtask build-ebpf --release
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    bindings::pt_regs,
    helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns, gen},
    macros::{kprobe, kretprobe, map},
    maps::{Array, HashMap, PerCpuArray, RingBuf},
    programs::{ProbeContext, RetProbeContext},
    EbpfContext,
};
use aya_log_ebpf::warn;
use kdbg_common::{
    copy_name, ControlState, DebugEvent, ExitAction, ProbeSymbol, RegisterSnapshot,
    CONTRACT_VERSION, CONTROL_KEY, COUNTER_DROPPED, COUNTER_EMITTED, COUNTER_FILTERED,
    COUNTER_SLOTS, EVENT_BREAKPOINT, EVENT_FUNCTION_ENTRY, EVENT_FUNCTION_EXIT, FLAG_RETURN_VALUE,
    MAX_BREAKPOINTS, MAX_PROBE_SYMBOLS, MODE_FULL,
};

// ============================================================================
// eBPF Maps - Shared data structures between kernel and userspace
// ============================================================================

/// Ring buffer for sending events to userspace
///
/// - **Size**: 4MB (~11k events)
/// - **Overflow**: `reserve()` fails, the event is dropped and counted
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(4 * 1024 * 1024, 0);

/// Debugger control state at index `CONTROL_KEY`
///
/// Written by the userspace breakpoint manager only.
#[map]
static CONTROL: Array<ControlState> = Array::with_max_entries(1, 0);

/// Map: function address → enabled flag (1 = enabled)
///
/// Mirrors the enabled subset of the userspace breakpoint set.
#[map]
static BREAKPOINTS: HashMap<u64, u8> = HashMap::with_max_entries(MAX_BREAKPOINTS, 0);

/// Map: function address → function name
#[map]
static PROBE_SYMBOLS: HashMap<u64, ProbeSymbol> = HashMap::with_max_entries(MAX_PROBE_SYMBOLS, 0);

/// Map: thread ID → address of the function it entered last
///
/// One slot per thread: nested probed calls on the same thread label the
/// outer exit with the inner function.
#[map]
static ENTRY_IPS: HashMap<u32, u64> = HashMap::with_max_entries(8192, 0);

/// Per-CPU counters indexed by `COUNTER_*`
#[map]
static EVENT_COUNTERS: PerCpuArray<u64> = PerCpuArray::with_max_entries(COUNTER_SLOTS, 0);

// ============================================================================
// eBPF Program Hooks
// ============================================================================

/// Hook: entry of an attached kernel function
#[kprobe]
pub fn function_entry(ctx: ProbeContext) -> u32 {
    match try_function_entry(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_function_entry(ctx: &ProbeContext) -> Result<(), i64> {
    // Hot path: nothing else happens while tracing is disabled
    let Some(control) = load_control() else {
        return Ok(());
    };
    if control.global_enable == 0 {
        return Ok(());
    }

    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    let tid = pid_tgid as u32;
    if !control.admits(pid) {
        bump_counter(COUNTER_FILTERED);
        return Ok(());
    }

    // Address of the probed function, same value kallsyms reports
    let func_ip = unsafe { gen::bpf_get_func_ip(ctx.as_ptr()) };

    let at_breakpoint = unsafe { BREAKPOINTS.get(&func_ip) }.is_some_and(|enabled| *enabled != 0);
    let full_mode = control.debug_mode == MODE_FULL;

    if full_mode {
        unsafe {
            let _ = ENTRY_IPS.insert(&tid, &func_ip, 0);
        }
    }

    let kind = if at_breakpoint {
        EVENT_BREAKPOINT
    } else if full_mode {
        EVENT_FUNCTION_ENTRY
    } else {
        bump_counter(COUNTER_FILTERED);
        return Ok(());
    };

    emit(ctx, ctx.regs, kind, pid, tid, func_ip, None);
    Ok(())
}

/// Hook: return from an attached kernel function
#[kretprobe]
pub fn function_exit(ctx: RetProbeContext) -> u32 {
    match try_function_exit(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_function_exit(ctx: &RetProbeContext) -> Result<(), i64> {
    let Some(control) = load_control() else {
        return Ok(());
    };
    if control.global_enable == 0 {
        return Ok(());
    }

    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    let tid = pid_tgid as u32;

    let entry = unsafe { ENTRY_IPS.get(&tid).copied() };
    if entry.is_some() {
        unsafe {
            let _ = ENTRY_IPS.remove(&tid);
        }
    }

    let func_ip = match control.exit_action(pid, entry.is_some()) {
        ExitAction::Skip => return Ok(()),
        ExitAction::Filter => {
            bump_counter(COUNTER_FILTERED);
            return Ok(());
        }
        ExitAction::Emit => entry.unwrap_or(0),
    };

    let return_value: u64 = ctx.ret().unwrap_or(0);
    emit(ctx, ctx.regs, EVENT_FUNCTION_EXIT, pid, tid, func_ip, Some(return_value));
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

#[inline(always)]
fn load_control() -> Option<ControlState> {
    CONTROL.get(CONTROL_KEY).copied()
}

#[inline(always)]
fn bump_counter(slot: u32) {
    if let Some(counter) = EVENT_COUNTERS.get_ptr_mut(slot) {
        unsafe { *counter += 1 };
    }
}

/// Reserve a ring buffer slot, fill it in place and submit it
///
/// A full ring buffer drops the event: counted, logged, never retried.
#[inline(always)]
fn emit<C: EbpfContext>(
    ctx: &C,
    regs: *mut pt_regs,
    kind: u8,
    pid: u32,
    tid: u32,
    func_ip: u64,
    return_value: Option<u64>,
) {
    let Some(mut entry) = EVENTS.reserve::<DebugEvent>(0) else {
        bump_counter(COUNTER_DROPPED);
        warn!(ctx, "ring buffer full, dropped event for pid {}", pid);
        return;
    };

    let event = entry.as_mut_ptr();
    unsafe {
        // Every byte is initialised before submit, including reserved fields
        core::ptr::write_bytes(event, 0, 1);

        (*event).version = CONTRACT_VERSION;
        (*event).kind = kind;
        (*event).pid = pid;
        (*event).tid = tid;
        (*event).cpu = gen::bpf_get_smp_processor_id();
        (*event).timestamp_ns = bpf_ktime_get_ns();
        (*event).instruction_pointer = func_ip;

        if let Some(symbol) = PROBE_SYMBOLS.get(&func_ip) {
            copy_name(&mut (*event).function_name, &symbol.name);
        }

        let mut flags = capture_registers(regs, &mut (*event).registers);
        if let Some(value) = return_value {
            (*event).return_value = value;
            flags |= FLAG_RETURN_VALUE;
        }
        (*event).flags = flags;
    }

    entry.submit(0);
    bump_counter(COUNTER_EMITTED);
}

// ============================================================================
// Register Capture (architecture-gated)
// ============================================================================

/// riscv64: the trap context exposes the full integer register file
#[cfg(bpf_target_arch = "riscv64")]
#[inline(always)]
unsafe fn capture_registers(regs: *mut pt_regs, out: &mut RegisterSnapshot) -> u8 {
    use kdbg_common::FLAG_REGISTERS;

    if regs.is_null() {
        return 0;
    }
    let r = &*regs;
    *out = RegisterSnapshot {
        pc: r.epc,
        ra: r.ra,
        sp: r.sp,
        gp: r.gp,
        tp: r.tp,
        t0: r.t0,
        t1: r.t1,
        t2: r.t2,
        s0: r.s0,
        s1: r.s1,
        a0: r.a0,
        a1: r.a1,
        a2: r.a2,
        a3: r.a3,
        a4: r.a4,
        a5: r.a5,
        a6: r.a6,
        a7: r.a7,
        s2: r.s2,
        s3: r.s3,
        s4: r.s4,
        s5: r.s5,
        s6: r.s6,
        s7: r.s7,
        s8: r.s8,
        s9: r.s9,
        s10: r.s10,
        s11: r.s11,
        t3: r.t3,
        t4: r.t4,
        t5: r.t5,
        t6: r.t6,
    };
    FLAG_REGISTERS
}

/// x86_64: map pc/sp/frame pointer and the six SysV argument registers onto
/// the RISC-V names; everything else stays zero and the snapshot is partial
#[cfg(bpf_target_arch = "x86_64")]
#[inline(always)]
unsafe fn capture_registers(regs: *mut pt_regs, out: &mut RegisterSnapshot) -> u8 {
    use kdbg_common::{FLAG_REGISTERS, FLAG_REGISTERS_PARTIAL};

    if regs.is_null() {
        return 0;
    }
    let r = &*regs;
    out.pc = r.rip;
    out.sp = r.rsp;
    out.s0 = r.rbp;
    out.a0 = r.rdi;
    out.a1 = r.rsi;
    out.a2 = r.rdx;
    out.a3 = r.rcx;
    out.a4 = r.r8;
    out.a5 = r.r9;
    FLAG_REGISTERS | FLAG_REGISTERS_PARTIAL
}

#[cfg(not(any(bpf_target_arch = "riscv64", bpf_target_arch = "x86_64")))]
#[inline(always)]
unsafe fn capture_registers(_regs: *mut pt_regs, _out: &mut RegisterSnapshot) -> u8 {
    0
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

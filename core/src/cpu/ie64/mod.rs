//! IE64 — 64-bit load/store RISC CPU
//!
//! A fixed-width 8-byte ISA with 32 general-purpose 64-bit registers.
//! R0 is hardwired to zero (writes are dropped at the decoder), R31
//! aliases the stack pointer. Every data operation carries a size code
//! (B/W/L/Q); width-N results are zero-extended to 64 bits.
//!
//! # Memory map (CPU view)
//!
//! | Range                 | Meaning                                  |
//! |-----------------------|------------------------------------------|
//! | `0x00000..0x01000`    | Vector table (plain RAM)                 |
//! | `0x01000..0x9F000`    | Program + heap; execution starts at base |
//! | `0x9F000`             | Initial stack pointer (grows down)       |
//! | `0xA0000..0xFFFFF`    | MMIO window, accessed through the bus    |
//!
//! The fetch loop caches the bus RAM pointer once per `execute()` and
//! services all sub-MMIO addresses directly; everything else goes
//! through bus dispatch at the access width.
//!
//! # Timer and interrupts
//!
//! A single down-counter is ticked cooperatively from the fetch loop:
//! every `TIMER_TICK_CYCLES` retired instructions the counter drops by
//! one, and on reaching zero the CPU takes an interrupt through
//! `irq_vector` (if enabled and not already in a handler) and reloads
//! the counter from the period. Expiries with interrupts masked or a
//! handler active are swallowed, not queued.
//!
//! The atomics in [`Ie64Shared`] are the cross-thread surface: MMIO
//! handlers arm the timer and set the vector, the host stops the CPU by
//! clearing `running` (checked every `RUN_CHECK_INTERVAL` instructions
//! with acquire ordering).

pub mod opcodes;

mod alu;
mod branch;
mod load_store;
mod stack;

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::core::bus::{MEM_SIZE, MemoryBus};
use crate::core::component::{Clock, SystemClock};
use crate::cpu::state::{CpuStateTrait, Ie64State};
use opcodes::*;

/// First executable address; `load_program` places the image here.
pub const PROG_START: u32 = 0x1000;

/// Initial stack pointer. The stack grows down from here.
pub const STACK_START: u64 = 0x9F000;

/// The PC is masked to the 32 MiB address space before every fetch.
pub const PC_MASK: u64 = 0x1FF_FFFF;

/// Retired instructions per timer tick, matched to the audio sample
/// clock so a timer period is counted in sample units.
pub const TIMER_TICK_CYCLES: u64 = 44_100;

/// How often the fetch loop polls the shared `running` flag.
pub const RUN_CHECK_INTERVAL: u64 = 4096;

/// Grace period after clearing `running` before reset proceeds, long
/// enough for the loop to observe the flag at its polling interval.
pub const RESET_DELAY: Duration = Duration::from_millis(50);

/// Hardware timer phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TimerState {
    Idle = 0,
    Running = 1,
    Expired = 2,
}

/// CPU flags shared with MMIO handlers and host threads.
///
/// Counters use relaxed ordering; the run/stop handshake and the
/// interrupt-enable flags use acquire/release.
pub struct Ie64Shared {
    pub running: AtomicBool,
    pub debug: AtomicBool,
    pub timer_count: AtomicU64,
    pub timer_period: AtomicU64,
    pub timer_enabled: AtomicBool,
    pub timer_state: AtomicU8,
    pub irq_vector: AtomicU64,
    pub irq_enabled: AtomicBool,
    pub irq_in_handler: AtomicBool,
}

impl Ie64Shared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            debug: AtomicBool::new(false),
            timer_count: AtomicU64::new(0),
            timer_period: AtomicU64::new(0),
            timer_enabled: AtomicBool::new(false),
            timer_state: AtomicU8::new(TimerState::Idle as u8),
            irq_vector: AtomicU64::new(0),
            irq_enabled: AtomicBool::new(false),
            irq_in_handler: AtomicBool::new(false),
        }
    }

    pub fn timer_state(&self) -> TimerState {
        match self.timer_state.load(Ordering::Relaxed) {
            1 => TimerState::Running,
            2 => TimerState::Expired,
            _ => TimerState::Idle,
        }
    }
}

/// Optional direct window into a video plane owned by another component.
/// Pure optimisation: behaviour must be identical with it absent.
pub(crate) struct VramWindow {
    pub base: *mut u8,
    pub start: u32,
    pub end: u32, // exclusive
}

/// Instruction-rate performance counters, reported at debug level once
/// per second when enabled.
struct Perf {
    enabled: bool,
    icount: u64,
    window_start: Instant,
    window_icount: u64,
}

pub struct Ie64 {
    pub regs: [u64; 32],
    pub pc: u64,
    shared: Arc<Ie64Shared>,
    bus: Arc<MemoryBus>,
    clock: Box<dyn Clock>,
    /// Instruction slots retired since the last timer tick.
    cycle_counter: u64,
    perf: Perf,
    pub(crate) vram_window: Option<VramWindow>,
    // RAM pointer cached from the bus; refreshed on entry to execute().
    ram: *mut u8,
    ram_len: usize,
}

// SAFETY: `ram` points into the bus allocation, which the owned
// `Arc<MemoryBus>` keeps alive; a VRAM window points into a plane owned
// by the video component for the life of the machine.
unsafe impl Send for Ie64 {}

impl Ie64 {
    pub fn new(bus: Arc<MemoryBus>) -> Self {
        let ram = bus.ram_ptr();
        let mut cpu = Self {
            regs: [0; 32],
            pc: PROG_START as u64,
            shared: Arc::new(Ie64Shared::new()),
            bus,
            clock: Box::new(SystemClock),
            cycle_counter: 0,
            perf: Perf {
                enabled: false,
                icount: 0,
                window_start: Instant::now(),
                window_icount: 0,
            },
            vram_window: None,
            ram,
            ram_len: MEM_SIZE,
        };
        cpu.regs[31] = STACK_START;
        cpu
    }

    /// Replace the wall-clock source (used by `WAIT` and perf reporting).
    pub fn set_clock(&mut self, clock: Box<dyn Clock>) {
        self.clock = clock;
    }

    /// Handle to the flags shared with MMIO handlers and host threads.
    pub fn shared(&self) -> Arc<Ie64Shared> {
        self.shared.clone()
    }

    pub fn bus(&self) -> &Arc<MemoryBus> {
        &self.bus
    }

    /// Enable per-second instruction-rate reports at debug log level.
    pub fn set_perf_enabled(&mut self, enabled: bool) {
        self.perf.enabled = enabled;
    }

    /// Install a direct window over `[start, end)` backed by `base`.
    ///
    /// # Safety
    ///
    /// `base` must stay valid for `end - start` bytes for as long as the
    /// CPU can execute.
    pub unsafe fn set_vram_window(&mut self, base: *mut u8, start: u32, end: u32) {
        self.vram_window = Some(VramWindow { base, start, end });
    }

    pub fn clear_vram_window(&mut self) {
        self.vram_window = None;
    }

    // --- Program loading / reset ---------------------------------------

    /// Copy a raw little-endian program image to `PROG_START` and point
    /// the PC at it. The rest of the program region is zeroed first.
    ///
    /// # Panics
    ///
    /// Panics if the image does not fit below the stack.
    pub fn load_program(&mut self, image: &[u8]) {
        let capacity = STACK_START as usize - PROG_START as usize;
        assert!(
            image.len() <= capacity,
            "program image of {} bytes exceeds {} byte region",
            image.len(),
            capacity
        );
        unsafe {
            let base = self.bus.ram_ptr().add(PROG_START as usize);
            ptr::write_bytes(base, 0, capacity);
            ptr::copy_nonoverlapping(image.as_ptr(), base, image.len());
        }
        self.pc = PROG_START as u64;
    }

    /// Load a program image from a file. See [`load_program`](Self::load_program).
    pub fn load_program_file(&mut self, path: &std::path::Path) -> std::io::Result<()> {
        let image = std::fs::read(path)?;
        self.load_program(&image);
        Ok(())
    }

    /// Halt the CPU, wait for the fetch loop to notice, and restore the
    /// power-on state: registers cleared, SP back to `STACK_START`, PC at
    /// `PROG_START`, timer and interrupt state idle, program region and
    /// everything above it zeroed.
    pub fn reset(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.clock.sleep(RESET_DELAY);

        self.regs = [0; 32];
        self.regs[31] = STACK_START;
        self.pc = PROG_START as u64;
        self.cycle_counter = 0;

        let sh = &self.shared;
        sh.timer_count.store(0, Ordering::Relaxed);
        sh.timer_period.store(0, Ordering::Relaxed);
        sh.timer_enabled.store(false, Ordering::Relaxed);
        sh.timer_state
            .store(TimerState::Idle as u8, Ordering::Relaxed);
        sh.irq_vector.store(0, Ordering::Relaxed);
        sh.irq_enabled.store(false, Ordering::Relaxed);
        sh.irq_in_handler.store(false, Ordering::Relaxed);

        unsafe {
            let base = self.bus.ram_ptr().add(PROG_START as usize);
            ptr::write_bytes(base, 0, MEM_SIZE - PROG_START as usize);
        }

        self.shared.running.store(true, Ordering::Release);
    }

    /// Stop the fetch loop from another thread.
    pub fn stop(shared: &Ie64Shared) {
        shared.running.store(false, Ordering::Release);
    }

    // --- Execution ------------------------------------------------------

    /// Run until `HALT`, a fatal guest fault, or an external stop.
    pub fn execute(&mut self) {
        self.ram = self.bus.ram_ptr();
        self.ram_len = MEM_SIZE;

        let start = self.pc & PC_MASK;
        if !(PROG_START as u64..STACK_START).contains(&start) {
            error!("IE64: initial PC {start:#010X} outside program region");
            self.shared.running.store(false, Ordering::Release);
            return;
        }

        self.perf.window_start = self.clock.now();
        self.perf.window_icount = 0;

        let mut until_check = RUN_CHECK_INTERVAL;
        loop {
            until_check -= 1;
            if until_check == 0 {
                until_check = RUN_CHECK_INTERVAL;
                if !self.shared.running.load(Ordering::Acquire) {
                    break;
                }
            }
            if !self.step_inner() {
                break;
            }
        }
    }

    /// Execute a single instruction. Returns false once the CPU halts.
    pub fn step(&mut self) -> bool {
        self.ram = self.bus.ram_ptr();
        self.ram_len = MEM_SIZE;
        if !self.shared.running.load(Ordering::Acquire) {
            return false;
        }
        self.step_inner()
    }

    fn step_inner(&mut self) -> bool {
        self.pc &= PC_MASK;
        let pc = self.pc;
        if pc as usize + 8 > self.ram_len {
            error!("IE64: instruction fetch out of bounds at {pc:#010X}");
            self.shared.running.store(false, Ordering::Release);
            return false;
        }

        let raw = unsafe {
            u64::from_le(ptr::read_unaligned(
                self.ram.add(pc as usize) as *const u64
            ))
        };
        let insn = Instruction::decode(raw);

        if self.shared.debug.load(Ordering::Relaxed) {
            log::trace!(
                "IE64 {pc:#010X}: op={:#04X} rd={} rs={} rt={} imm={:#010X}",
                insn.opcode,
                insn.rd,
                insn.rs,
                insn.rt,
                insn.imm
            );
        }
        if self.perf.enabled {
            self.perf_tick();
        }

        // Timer runs before dispatch: a taken interrupt abandons the
        // fetched instruction, which re-executes after RTI (its address
        // is what was pushed).
        if self.timer_step() {
            return true;
        }

        self.dispatch(&insn)
    }

    fn dispatch(&mut self, i: &Instruction) -> bool {
        match i.opcode {
            OP_NOP => self.advance(),
            OP_HALT => {
                self.shared.running.store(false, Ordering::Release);
                false
            }
            OP_SEI => {
                self.shared.irq_enabled.store(true, Ordering::Release);
                self.advance()
            }
            OP_CLI => {
                self.shared.irq_enabled.store(false, Ordering::Release);
                self.advance()
            }
            OP_RTI => self.op_rti(),
            OP_WAIT => {
                self.clock.sleep(Duration::from_micros(i.imm as u64));
                self.advance()
            }

            OP_MOVE | OP_MOVT | OP_MOVEQ | OP_LEA => {
                self.op_move_group(i);
                self.advance()
            }
            OP_LOAD | OP_STORE => {
                self.op_mem_group(i);
                self.advance()
            }

            OP_ADD | OP_SUB | OP_MULU | OP_MULS | OP_DIVU | OP_DIVS | OP_MOD | OP_NEG
            | OP_AND | OP_OR | OP_EOR | OP_NOT | OP_LSL | OP_LSR | OP_ASR => {
                self.op_alu(i);
                self.advance()
            }

            OP_BRA | OP_BEQ | OP_BNE | OP_BLT | OP_BGE | OP_BGT | OP_BLE | OP_BHI | OP_BLS => {
                self.op_branch(i);
                true
            }
            OP_JMP => {
                self.pc = self.operand3(i);
                true
            }
            OP_JSR | OP_JSR_IND => self.op_jsr(i),
            OP_RTS => self.op_rts(),
            OP_PUSH | OP_POP => self.op_stack(i),

            other => {
                error!("IE64: invalid opcode {other:#04X} at {:#010X}", self.pc);
                self.shared.running.store(false, Ordering::Release);
                false
            }
        }
    }

    #[inline]
    fn advance(&mut self) -> bool {
        self.pc += 8;
        true
    }

    /// Third-operand resolution: `imm32` zero-extended when X is set,
    /// otherwise `Rt`.
    #[inline]
    pub(crate) fn operand3(&self, i: &Instruction) -> u64 {
        if i.imm_form {
            i.imm as u64
        } else {
            self.regs[i.rt]
        }
    }

    /// Register writeback; R0 writes are dropped here.
    #[inline]
    pub(crate) fn set_reg(&mut self, rd: usize, val: u64) {
        if rd != 0 {
            self.regs[rd] = val;
        }
    }

    // --- Timer / interrupts --------------------------------------------

    /// One cooperative timer step. Returns true if an interrupt was
    /// taken (the caller abandons the current instruction).
    fn timer_step(&mut self) -> bool {
        let sh = &self.shared;
        if !sh.timer_enabled.load(Ordering::Relaxed) {
            return false;
        }
        self.cycle_counter += 1;
        if self.cycle_counter < TIMER_TICK_CYCLES {
            return false;
        }
        self.cycle_counter = 0;

        let count = sh.timer_count.load(Ordering::Relaxed);
        if count == 0 {
            // Counter was never armed (or was cleared): arm from the
            // period without firing.
            let period = sh.timer_period.load(Ordering::Relaxed);
            if period > 0 {
                sh.timer_count.store(period, Ordering::Relaxed);
                sh.timer_state
                    .store(TimerState::Running as u8, Ordering::Relaxed);
            }
            return false;
        }

        let count = count - 1;
        sh.timer_count.store(count, Ordering::Relaxed);
        if count > 0 {
            return false;
        }

        sh.timer_state
            .store(TimerState::Expired as u8, Ordering::Relaxed);
        let taken = self.handle_interrupt();
        // The handler may have disabled the timer; only then skip the
        // reload.
        let sh = &self.shared;
        if sh.timer_enabled.load(Ordering::Relaxed) {
            let period = sh.timer_period.load(Ordering::Relaxed);
            sh.timer_count.store(period, Ordering::Relaxed);
            if period > 0 {
                sh.timer_state
                    .store(TimerState::Running as u8, Ordering::Relaxed);
            }
        }
        taken
    }

    /// Take an interrupt if enabled and not already in a handler:
    /// push the current PC, jump through `irq_vector`, and mask further
    /// interrupts until RTI. Swallowed otherwise.
    pub(crate) fn handle_interrupt(&mut self) -> bool {
        let sh = &self.shared;
        if !sh.irq_enabled.load(Ordering::Acquire) || sh.irq_in_handler.load(Ordering::Acquire) {
            return false;
        }
        sh.irq_in_handler.store(true, Ordering::Release);
        let pc = self.pc;
        if !self.push64(pc) {
            return false;
        }
        self.pc = self.shared.irq_vector.load(Ordering::Relaxed);
        true
    }

    fn perf_tick(&mut self) {
        self.perf.icount += 1;
        self.perf.window_icount += 1;
        if self.perf.window_icount & 0xFFFF != 0 {
            return;
        }
        let elapsed = self.clock.now() - self.perf.window_start;
        if elapsed >= Duration::from_secs(1) {
            let ips = self.perf.window_icount as f64 / elapsed.as_secs_f64();
            debug!(
                "IE64: {:.1} M insn/s ({} total)",
                ips / 1_000_000.0,
                self.perf.icount
            );
            self.perf.window_start = self.clock.now();
            self.perf.window_icount = 0;
        }
    }
}

impl CpuStateTrait for Ie64 {
    type Snapshot = Ie64State;

    fn snapshot(&self) -> Ie64State {
        Ie64State {
            regs: self.regs,
            pc: self.pc,
            halted: !self.shared.running.load(Ordering::Acquire),
        }
    }
}

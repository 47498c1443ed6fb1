//! The Intuition Engine board: IE64 CPU, memory bus, raster
//! coprocessor, and PSG translation engine wired together.
//!
//! Construction follows the bus sealing protocol: every device maps its
//! MMIO window first, then the map is sealed, then execution may start.
//! The singletons are owned here; nothing is ambient.
//!
//! # Board memory map (beyond the core CPU map)
//!
//! | Address   | Meaning                                       |
//! |-----------|-----------------------------------------------|
//! | `0xE0000` | TIMER_CTRL: bit 0 enable; read bit 1 expired  |
//! | `0xE0004` | TIMER_PERIOD: reload value in sample ticks    |
//! | `0xE0008` | TIMER_COUNT: current down-counter (read)      |
//! | `0xE000C` | IRQ_VECTOR: interrupt entry point             |
//! | `0xF0008` | VIDEO_STATUS: bit 0 VBlank (lock-free read)   |
//! | `0xF001C` | BLT_CTRL and the blitter register file        |
//! | `0x100000`| VRAM plane, 640x480 BGRA                      |

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use intuition_core::core::bus::MemoryBus;
use intuition_core::core::component::SampleTicker;
use intuition_core::core::machine::{InputButton, Machine};
use intuition_core::cpu::ie64::{Ie64Shared, PROG_START, STACK_START, TimerState};
use intuition_core::cpu::{CpuStateTrait, Ie64, Ie64State};
use intuition_core::device::blitter::{Blitter, VRAM_START, VideoMode};
use intuition_core::device::psg::{DEFAULT_PSG_CLOCK_HZ, PsgEngine};
use intuition_core::device::synth::VoiceRegisterFile;

use crate::registry::MachineEntry;

// CPU timer / interrupt MMIO registers.
pub const TIMER_CTRL: u32 = 0xE0000;
pub const TIMER_PERIOD: u32 = 0xE0004;
pub const TIMER_COUNT: u32 = 0xE0008;
pub const IRQ_VECTOR: u32 = 0xE000C;

const TIMER_CTRL_ENABLE: u32 = 0x01;
const TIMER_CTRL_EXPIRED: u32 = 0x02;

/// Host audio rate the PSG engine ticks at.
pub const AUDIO_SAMPLE_RATE: u32 = 44_100;

/// Errors from loading a program image.
#[derive(Debug)]
pub enum ProgramLoadError {
    /// Underlying I/O error (file not found, permission denied, etc.)
    Io(std::io::Error),

    /// Image does not fit between `PROG_START` and the stack.
    TooLarge { size: usize, max: usize },
}

impl fmt::Display for ProgramLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::TooLarge { size, max } => {
                write!(f, "program image of {size} bytes exceeds {max} byte region")
            }
        }
    }
}

impl From<std::io::Error> for ProgramLoadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// The wired Intuition Engine system.
pub struct IntuitionSystem {
    bus: Arc<MemoryBus>,
    cpu: Ie64,
    cpu_shared: Arc<Ie64Shared>,
    blitter: Arc<Blitter>,
    psg: PsgEngine,
    synth: Arc<Mutex<VoiceRegisterFile>>,
    video_status: Arc<AtomicU32>,
    frame: u64,
}

impl IntuitionSystem {
    pub fn new() -> Self {
        let bus = Arc::new(MemoryBus::new());
        let mode = VideoMode::DEFAULT;

        let blitter = Arc::new(Blitter::new(bus.clone(), mode));
        blitter.map(&bus);

        let cpu = Ie64::new(bus.clone());
        let cpu_shared = cpu.shared();
        Self::map_cpu_registers(&bus, &cpu_shared);

        let video_status = Arc::new(AtomicU32::new(0));
        let vs = video_status.clone();
        bus.set_video_status_reader(Box::new(move || vs.load(Ordering::Acquire)));

        bus.seal_mappings();

        let synth = Arc::new(Mutex::new(VoiceRegisterFile::new()));
        let mut psg = PsgEngine::new(AUDIO_SAMPLE_RATE, DEFAULT_PSG_CLOCK_HZ);
        psg.set_synth(synth.clone());

        Self {
            bus,
            cpu,
            cpu_shared,
            blitter,
            psg,
            synth,
            video_status,
            frame: 0,
        }
    }

    /// Timer and interrupt control backed directly by the CPU's shared
    /// atomics.
    fn map_cpu_registers(bus: &MemoryBus, shared: &Arc<Ie64Shared>) {
        let rd = shared.clone();
        let wr = shared.clone();
        bus.map_io(
            TIMER_CTRL,
            IRQ_VECTOR + 3,
            Box::new(move |addr| match addr {
                TIMER_CTRL => {
                    let mut v = 0;
                    if rd.timer_enabled.load(Ordering::Relaxed) {
                        v |= TIMER_CTRL_ENABLE;
                    }
                    if rd.timer_state() == TimerState::Expired {
                        v |= TIMER_CTRL_EXPIRED;
                    }
                    v
                }
                TIMER_PERIOD => rd.timer_period.load(Ordering::Relaxed) as u32,
                TIMER_COUNT => rd.timer_count.load(Ordering::Relaxed) as u32,
                IRQ_VECTOR => rd.irq_vector.load(Ordering::Relaxed) as u32,
                _ => 0,
            }),
            Box::new(move |addr, val| match addr {
                TIMER_CTRL => {
                    wr.timer_enabled
                        .store(val & TIMER_CTRL_ENABLE != 0, Ordering::Relaxed);
                }
                TIMER_PERIOD => {
                    wr.timer_period.store(val as u64, Ordering::Relaxed);
                    wr.timer_count.store(val as u64, Ordering::Relaxed);
                }
                IRQ_VECTOR => wr.irq_vector.store(val as u64, Ordering::Relaxed),
                _ => {}
            }),
        );
    }

    // --- Program control ------------------------------------------------

    /// Load a raw program image at `PROG_START`.
    pub fn load_program(&mut self, image: &[u8]) -> Result<(), ProgramLoadError> {
        let max = STACK_START as usize - PROG_START as usize;
        if image.len() > max {
            return Err(ProgramLoadError::TooLarge {
                size: image.len(),
                max,
            });
        }
        self.cpu.load_program(image);
        Ok(())
    }

    pub fn load_program_file(&mut self, path: &Path) -> Result<(), ProgramLoadError> {
        let image = std::fs::read(path)?;
        self.load_program(&image)
    }

    /// Run the CPU to halt on the calling thread.
    pub fn run(&mut self) {
        self.cpu.execute();
    }

    /// Run the CPU with a wall-clock deadline: a watchdog thread clears
    /// the shared `running` flag if the guest has not halted in time.
    pub fn run_with_deadline(&mut self, deadline: Duration) {
        self.cpu_shared.running.store(true, Ordering::Release);
        let shared = self.cpu_shared.clone();
        let finished = Arc::new(AtomicBool::new(false));
        let watchdog_finished = finished.clone();
        let watchdog = thread::spawn(move || {
            let start = Instant::now();
            while !watchdog_finished.load(Ordering::Acquire) {
                if start.elapsed() >= deadline {
                    shared.running.store(false, Ordering::Release);
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
        });
        self.cpu.execute();
        finished.store(true, Ordering::Release);
        let _ = watchdog.join();
    }

    /// Ask a running CPU to stop at its next poll point.
    pub fn stop(&self) {
        self.cpu_shared.running.store(false, Ordering::Release);
    }

    pub fn cpu_state(&self) -> Ie64State {
        self.cpu.snapshot()
    }

    // --- Component access ----------------------------------------------

    pub fn bus(&self) -> &Arc<MemoryBus> {
        &self.bus
    }

    pub fn blitter(&self) -> &Arc<Blitter> {
        &self.blitter
    }

    pub fn psg_mut(&mut self) -> &mut PsgEngine {
        &mut self.psg
    }

    pub fn synth_registers(&self) -> &Arc<Mutex<VoiceRegisterFile>> {
        &self.synth
    }

    /// Advance the audio clock by `samples` ticks. In a hosted build the
    /// audio backend callback drives this.
    pub fn tick_audio(&mut self, samples: usize) {
        for _ in 0..samples {
            self.psg.tick_sample();
        }
    }
}

impl Default for IntuitionSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine for IntuitionSystem {
    fn display_size(&self) -> (u32, u32) {
        let mode = self.blitter.mode();
        (mode.width, mode.height)
    }

    fn run_frame(&mut self) {
        // Drain any blitter work queued by the guest, then flip VBlank.
        self.blitter.drain_jobs();
        self.frame += 1;
        self.video_status
            .store((self.frame & 1) as u32, Ordering::Release);
    }

    fn render_frame(&self, buffer: &mut [u8]) {
        let mode = self.blitter.mode();
        let pixels = (mode.width * mode.height) as usize;
        let ram = self.bus.ram();
        let plane = &ram[VRAM_START as usize..VRAM_START as usize + pixels * 4];
        for (i, bgra) in plane.chunks_exact(4).enumerate().take(buffer.len() / 3) {
            buffer[i * 3] = bgra[2];
            buffer[i * 3 + 1] = bgra[1];
            buffer[i * 3 + 2] = bgra[0];
        }
    }

    fn set_input(&mut self, _button: u8, _pressed: bool) {
        // Input arrives through terminal MMIO, outside this board model.
    }

    fn input_map(&self) -> &[InputButton] {
        &[]
    }

    fn reset(&mut self) {
        self.cpu.reset();
        self.psg.stop();
        self.frame = 0;
        self.video_status.store(0, Ordering::Release);
    }

    fn audio_sample_rate(&self) -> u32 {
        AUDIO_SAMPLE_RATE
    }
}

// ---------------------------------------------------------------------------
// Machine registry
// ---------------------------------------------------------------------------

fn create_machine() -> Box<dyn Machine> {
    Box::new(IntuitionSystem::new())
}

inventory::submit! {
    MachineEntry::new("intuition", create_machine)
}

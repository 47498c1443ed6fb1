//! PSG translation engine — AY/YM register mirror to flexible voices
//!
//! Translates pre-parsed AY-3-8910 / YM2149 register writes into the
//! synth chip's flexible-voice register blocks, at sample rate. Three
//! square-wave tone channels and one noise channel map onto four
//! voices; the shape-driven envelope generator runs in software and
//! feeds the per-channel volume when selected.
//!
//! # Register mirror (AY/YM layout)
//!
//! | Reg     | Description                                            |
//! |---------|--------------------------------------------------------|
//! | R0/R1   | Channel A tone period (8 LSB + 4 MSB), 12 bits         |
//! | R2/R3   | Channel B tone period                                  |
//! | R4/R5   | Channel C tone period                                  |
//! | R6      | Noise period, 5 bits                                   |
//! | R7      | Mixer: bits 0-2 tone A/B/C, bits 3-5 noise A/B/C; active low |
//! | R8-R10  | Channel volume; bit 4 selects envelope mode            |
//! | R11/R12 | Envelope period, 16 bits                               |
//! | R13     | Envelope shape: continue, attack, alternate, hold      |
//!
//! # Event scheduling
//!
//! The engine consumes a queue of [`PsgEvent`]s ordered by sample
//! position (ties resolved in queue order, last write wins). Each
//! [`tick_sample`](PsgEngine::tick_sample):
//!
//! 1. Advance the envelope generator.
//! 2. While playing, drain every due event into the register mirror
//!    (writes to R11/R12 recompute the envelope period; a write to R13
//!    resets the envelope), then re-sync the synth voices.
//! 3. Advance the sample position; at end-of-stream either rewind to
//!    the loop point or stop and silence all voices.
//!
//! # Volume curves
//!
//! [`psg_volume_gain`] maps a 4-bit level to a DAC gain: a linear ramp
//! normally, or a 2 dB-per-step exponential curve in "PSG+" mode.

use std::sync::{Arc, Mutex};

use crate::core::component::SampleTicker;
use crate::device::synth::{
    CTRL_ENABLE, CTRL_GATE, NOISE_MODE_LFSR_PSG, SynthRegisters, VOICE_ATTACK, VOICE_COUNT,
    VOICE_CTRL, VOICE_DECAY, VOICE_FREQ, VOICE_NOISE_MODE, VOICE_RELEASE, VOICE_SUSTAIN,
    VOICE_VOLUME, VOICE_WAVEFORM, WAVE_SQUARE,
};

/// Default AY master clock (NTSC colourburst / 2).
pub const DEFAULT_PSG_CLOCK_HZ: f64 = 1_789_773.0;

/// The flexible voice carrying the noise channel.
const NOISE_VOICE: usize = 3;

/// One pre-parsed register write, scheduled at an absolute sample
/// position. `reg` is 0-13 in the AY register file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PsgEvent {
    pub sample: u64,
    pub reg: u8,
    pub value: u8,
}

/// Shape-driven envelope generator state.
struct Envelope {
    period_samples: f64,
    sample_counter: f64,
    level: i32,
    direction: i32,
    continue_flag: bool,
    alternate: bool,
    attack: bool,
    hold_request: bool,
    hold_active: bool,
}

impl Envelope {
    fn new() -> Self {
        Self {
            period_samples: 1.0,
            sample_counter: 0.0,
            level: 0,
            direction: -1,
            continue_flag: false,
            alternate: false,
            attack: false,
            hold_request: false,
            hold_active: true,
        }
    }

    /// One envelope step: add the direction, and resolve boundary
    /// behaviour from the shape flags.
    fn advance(&mut self) {
        let next = self.level + self.direction;
        if (0..=15).contains(&next) {
            self.level = next;
            return;
        }
        // Hit a boundary.
        if !self.continue_flag {
            self.level = 0;
            self.hold_active = true;
            return;
        }
        if self.hold_request {
            if self.alternate {
                self.level = 15 - self.level;
            }
            self.hold_active = true;
            return;
        }
        if self.alternate {
            // Triangle: reverse direction, boundary value already held.
            self.direction = -self.direction;
        } else {
            // Sawtooth: wrap to the opposite boundary.
            self.level = if self.direction > 0 { 0 } else { 15 };
        }
    }
}

/// The PSG engine: AY register mirror, envelope generator, and the
/// per-sample event scheduler.
pub struct PsgEngine {
    synth: Option<Arc<Mutex<dyn SynthRegisters>>>,
    regs: [u8; 14],
    envelope: Envelope,

    events: Vec<PsgEvent>,
    event_idx: usize,
    current_sample: u64,
    total_samples: u64,
    loop_enabled: bool,
    loop_sample: u64,
    loop_event_idx: usize,

    playing: bool,
    enabled: bool,
    psg_plus: bool,
    channels_init: bool,

    sample_rate: u32,
    clock_hz: f64,
}

impl PsgEngine {
    pub fn new(sample_rate: u32, clock_hz: f64) -> Self {
        Self {
            synth: None,
            regs: [0; 14],
            envelope: Envelope::new(),
            events: Vec::new(),
            event_idx: 0,
            current_sample: 0,
            total_samples: 0,
            loop_enabled: false,
            loop_sample: 0,
            loop_event_idx: 0,
            playing: false,
            enabled: false,
            psg_plus: false,
            channels_init: false,
            sample_rate,
            clock_hz,
        }
    }

    /// Attach the flexible-voice sink. A missing synth silently no-ops
    /// every sync.
    pub fn set_synth(&mut self, synth: Arc<Mutex<dyn SynthRegisters>>) {
        self.synth = Some(synth);
    }

    pub fn set_psg_plus(&mut self, on: bool) {
        self.psg_plus = on;
    }

    pub fn set_enabled(&mut self, on: bool) {
        self.enabled = on;
    }

    pub fn set_clock_hz(&mut self, clock_hz: f64) {
        self.clock_hz = clock_hz;
        self.update_envelope_period();
    }

    /// Install a new event queue and start playback from sample zero.
    /// With looping, the rewind event index is precomputed as the first
    /// event at or after `loop_sample`.
    pub fn set_events(
        &mut self,
        events: Vec<PsgEvent>,
        total_samples: u64,
        loop_enabled: bool,
        loop_sample: u64,
    ) {
        self.loop_event_idx = if loop_enabled {
            events
                .iter()
                .position(|e| e.sample >= loop_sample)
                .unwrap_or(events.len())
        } else {
            0
        };
        self.events = events;
        self.event_idx = 0;
        self.current_sample = 0;
        self.total_samples = total_samples;
        self.loop_enabled = loop_enabled;
        self.loop_sample = loop_sample;
        self.playing = true;
        self.enabled = true;
        self.channels_init = false;
    }

    /// Stop playback and silence every voice.
    pub fn stop(&mut self) {
        self.playing = false;
        self.silence_all();
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn current_sample(&self) -> u64 {
        self.current_sample
    }

    pub fn envelope_level(&self) -> u32 {
        self.envelope.level as u32
    }

    pub fn read_register(&self, reg: u8) -> u8 {
        self.regs[(reg & 0x0F).min(13) as usize]
    }

    /// Write one mirror register with side effects: R11/R12 recompute
    /// the envelope period, R13 resets the envelope.
    ///
    /// # Panics
    ///
    /// `reg` above 13 is a contract violation by the upstream parser.
    pub fn write_register(&mut self, reg: u8, value: u8) {
        assert!(reg <= 13, "PSG register {reg} out of range");
        self.regs[reg as usize] = value;
        match reg {
            11 | 12 => self.update_envelope_period(),
            13 => self.reset_envelope(),
            _ => {}
        }
    }

    // --- Envelope -------------------------------------------------------

    /// One envelope step lasts `sample_rate * 256 * period / clock`
    /// samples; a zero period counts as 1.
    fn update_envelope_period(&mut self) {
        let period = ((self.regs[12] as u32) << 8 | self.regs[11] as u32).max(1);
        self.envelope.period_samples =
            self.sample_rate as f64 * 256.0 * period as f64 / self.clock_hz;
    }

    /// Shape bits (R13 low nibble): bit 3 continue, bit 2 attack,
    /// bit 1 alternate, bit 0 hold.
    fn reset_envelope(&mut self) {
        let shape = self.regs[13] & 0x0F;
        let e = &mut self.envelope;
        e.continue_flag = shape & 0x08 != 0;
        e.attack = shape & 0x04 != 0;
        e.alternate = shape & 0x02 != 0;
        e.hold_request = shape & 0x01 != 0;
        e.level = if e.attack { 0 } else { 15 };
        e.direction = if e.attack { 1 } else { -1 };
        e.hold_active = false;
        e.sample_counter = 0.0;
    }

    fn envelope_tick(&mut self) {
        let e = &mut self.envelope;
        if e.hold_active {
            return;
        }
        e.sample_counter += 1.0;
        while e.sample_counter >= e.period_samples && !e.hold_active {
            e.sample_counter -= e.period_samples;
            e.advance();
        }
    }

    // --- Scheduling -----------------------------------------------------

    /// 12-bit tone period for channel 0-2; a zero period counts as 1.
    fn tone_period(&self, ch: usize) -> u32 {
        ((self.regs[ch * 2] as u32) | (((self.regs[ch * 2 + 1] & 0x0F) as u32) << 8)).max(1)
    }

    /// Effective 4-bit level for a tone channel: the fixed low nibble,
    /// or the envelope level when bit 4 is set with a clear upper
    /// nibble (a non-zero upper nibble overrides back to fixed).
    fn channel_level(&self, ch: usize) -> u32 {
        let v = self.regs[8 + ch];
        if v & 0x10 != 0 && v & 0xE0 == 0 {
            self.envelope.level as u32
        } else {
            (v & 0x0F) as u32
        }
    }

    fn tone_enabled(&self, ch: usize) -> bool {
        self.regs[7] & (1 << ch) == 0
    }

    fn noise_enabled(&self, ch: usize) -> bool {
        self.regs[7] & (1 << (ch + 3)) == 0
    }

    fn silence_all(&mut self) {
        if let Some(synth) = &self.synth {
            let mut synth = synth.lock().unwrap();
            for voice in 0..VOICE_COUNT {
                synth.write(voice, VOICE_VOLUME, 0);
            }
        }
    }

    /// Mirror the current register state into the flexible voices. On
    /// the first sync after a queue install the voices are initialised:
    /// square waveform for the tones, PSG LFSR noise for the noise
    /// voice, a gate-only ADSR of (0, 0, 255, 0), and both control bits
    /// on.
    fn sync_to_synth(&mut self) {
        let Some(synth) = &self.synth else {
            return;
        };
        let mut synth = synth.lock().unwrap();

        if !self.channels_init {
            self.channels_init = true;
            for voice in 0..VOICE_COUNT {
                if voice == NOISE_VOICE {
                    synth.write(voice, VOICE_NOISE_MODE, NOISE_MODE_LFSR_PSG);
                } else {
                    synth.write(voice, VOICE_WAVEFORM, WAVE_SQUARE);
                }
                synth.write(voice, VOICE_ATTACK, 0);
                synth.write(voice, VOICE_DECAY, 0);
                synth.write(voice, VOICE_SUSTAIN, 255);
                synth.write(voice, VOICE_RELEASE, 0);
                synth.write(voice, VOICE_CTRL, CTRL_GATE | CTRL_ENABLE);
            }
        }

        // Tone voices: period to Hz in 16.8 fixed point, gained volume.
        for ch in 0..3 {
            let freq = self.clock_hz / (16.0 * self.tone_period(ch) as f64);
            synth.write(ch, VOICE_FREQ, (freq * 256.0) as u32);

            let gain = if self.tone_enabled(ch) {
                psg_volume_gain(self.channel_level(ch), self.psg_plus)
            } else {
                0.0
            };
            synth.write(ch, VOICE_VOLUME, (gain * 255.0) as u32);
        }

        // Noise voice: 5-bit period, DAC from the sum of every channel
        // with noise enabled, clamped to full scale.
        let noise_period = ((self.regs[6] & 0x1F) as u32).max(1);
        let noise_freq = self.clock_hz / (16.0 * noise_period as f64);
        synth.write(NOISE_VOICE, VOICE_FREQ, (noise_freq * 256.0) as u32);

        let mut noise_gain = 0.0;
        for ch in 0..3 {
            if self.noise_enabled(ch) {
                noise_gain += psg_volume_gain(self.channel_level(ch), self.psg_plus);
            }
        }
        let noise_gain = noise_gain.min(1.0);
        synth.write(NOISE_VOICE, VOICE_VOLUME, (noise_gain * 255.0) as u32);
    }
}

impl SampleTicker for PsgEngine {
    fn tick_sample(&mut self) {
        if !self.enabled {
            return;
        }
        self.envelope_tick();

        if self.playing {
            // Due events apply in queue order; the last write wins.
            while self.event_idx < self.events.len()
                && self.events[self.event_idx].sample <= self.current_sample
            {
                let ev = self.events[self.event_idx];
                self.write_register(ev.reg, ev.value);
                self.event_idx += 1;
            }
            self.sync_to_synth();
        }

        self.current_sample += 1;
        if self.current_sample >= self.total_samples && self.playing {
            if self.loop_enabled {
                self.current_sample = self.loop_sample;
                self.event_idx = self.loop_event_idx;
            } else {
                self.playing = false;
                self.silence_all();
            }
        }
    }
}

/// DAC gain for a 4-bit PSG level: a linear ramp, or a 2 dB-per-step
/// exponential curve in PSG+ mode. Level 0 is silence on both curves.
pub fn psg_volume_gain(level: u32, psg_plus: bool) -> f64 {
    let level = level.min(15);
    if level == 0 {
        return 0.0;
    }
    if psg_plus {
        10f64.powf(-((15 - level) as f64) * 2.0 / 20.0)
    } else {
        level as f64 / 15.0
    }
}

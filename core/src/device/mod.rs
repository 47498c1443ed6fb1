pub mod blitter;
pub mod psg;
pub mod sn76489;
pub mod synth;

pub use blitter::{Blitter, VideoMode};
pub use psg::{PsgEngine, PsgEvent};
pub use sn76489::Sn76489Translator;
pub use synth::{SynthRegisters, VoiceRegisterFile};

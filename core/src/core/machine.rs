/// Describes a single input button that a machine accepts.
pub struct InputButton {
    /// Machine-defined button identifier, passed to `set_input()`.
    pub id: u8,
    /// Human-readable name for display/configuration (e.g., "P1 Left", "Coin").
    pub name: &'static str,
}

/// Machine-agnostic interface for emulated systems.
///
/// Each wired system implements this trait to provide a uniform surface
/// for a front end. The front end is a pure rendering engine that does
/// not know about specific hardware (blitters, PSGs, pixel formats).
pub trait Machine {
    /// Native display resolution as (width, height) in pixels.
    fn display_size(&self) -> (u32, u32);

    /// Run one frame of emulation (advance coprocessors by one frame's
    /// worth of work and step the video status).
    fn run_frame(&mut self);

    /// Render the current video state into an RGB24 pixel buffer.
    ///
    /// The buffer must be at least `width * height * 3` bytes (from
    /// `display_size()`). Pixels are stored left-to-right, top-to-bottom,
    /// 3 bytes per pixel (R, G, B). The machine converts its internal
    /// representation (e.g., a BGRA plane) into this standard format.
    fn render_frame(&self, buffer: &mut [u8]);

    /// Handle an input event. `button` is a machine-defined ID from
    /// `input_map()`. `pressed` is true for key-down, false for key-up.
    fn set_input(&mut self, button: u8, pressed: bool);

    /// Get the list of input buttons this machine accepts.
    fn input_map(&self) -> &[InputButton];

    /// Reset the machine to its initial power-on state.
    fn reset(&mut self);

    /// Fill an audio buffer with mono samples; returns how many were
    /// written. Machines without an audio path keep the default no-op.
    fn fill_audio(&mut self, _buffer: &mut [i16]) -> usize {
        0
    }

    /// Host audio sample rate the machine mixes at.
    fn audio_sample_rate(&self) -> u32 {
        44100
    }

    /// Nominal display refresh rate.
    fn frame_rate_hz(&self) -> f64 {
        60.0
    }
}

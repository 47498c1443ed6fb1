pub mod bus;
pub mod component;
pub mod machine;

pub use bus::{LegacyMmio64Policy, MemoryBus};
pub use component::{Clock, SampleTicker, SystemClock};
pub use machine::{InputButton, Machine};

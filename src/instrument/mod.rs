//! Instrument drivers and the [`Bench`] facade over them.

pub mod bench;
pub mod interface;
pub mod power;
pub mod serial;
pub mod sim;
pub mod solstis;
pub mod spad;
pub mod switch;

pub use bench::HardwareBench;
pub use interface::Bench;
pub use sim::SimBench;

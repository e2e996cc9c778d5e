pub mod buffer;
pub mod worker;

pub use buffer::{BufferStats, WriteBuffer};
pub use worker::Worker;

pub mod constants;
pub mod timestamp;

pub use constants::*;
pub use timestamp::{instant_to_nanos, nanos_to_instant};

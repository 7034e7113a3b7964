//! Helper utilities, macros, and types.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod error;
mod latency;

pub use bitmap::Bitmap;
pub use error::CoordError;
pub use latency::LatencyTracker;

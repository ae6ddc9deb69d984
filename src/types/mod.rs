//! Shared data structures for the telemetry processing pipeline
//!
//! - `time`: spacecraft elapsed time and its arithmetic
//! - `packet`: decoded telemetry packets and reassembled sequences
//! - `product`: control/data tables of a decoded product
//! - `naming`: the archive file-name convention

mod naming;
mod packet;
mod product;
mod time;

pub use naming::*;
pub use packet::*;
pub use product::*;
pub use time::*;

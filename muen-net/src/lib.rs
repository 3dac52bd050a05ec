//! muennet-style framing, per-mark PMTU and child demultiplex layered on
//! top of `muen-core` SHMStream channels.
#[macro_use]
extern crate log;

pub mod config;
pub mod device;
pub mod frame;
pub mod pmtu;
pub mod reader;
pub mod writer;

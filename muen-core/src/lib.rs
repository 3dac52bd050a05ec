//! Sinfo directory, CPU affinity registry and SHMStream v2 channels for
//! Linux subjects running under the Muen Separation Kernel.
#[macro_use]
extern crate log;

pub mod affinity;
pub mod channel;
pub mod error;
pub mod platform;
pub mod reader;
pub mod sinfo;
pub mod writer;

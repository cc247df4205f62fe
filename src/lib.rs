pub mod cache_array;
pub mod coherence;
pub mod config;
pub mod directory;
pub mod listener;
pub mod mem_event;
pub mod mshr;

pub use coherence::{Disposition, MesiDirectory, MissClass};
pub use config::Config;
pub use mem_event::{Command, MemEvent};

/// Memory addresses.
#[allow(non_camel_case_types)]
pub type address = u64;

//! Command history and run storage backends.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "file")]
pub mod file;

#[cfg(feature = "memory")]
pub use memory::{MemoryHistory, MemoryRunStorage};

#[cfg(feature = "file")]
pub use file::{FileRunStorage, JsonlHistory};

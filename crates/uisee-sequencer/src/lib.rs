//! Step sequencing and persistence.
//!
//! Provides:
//! - `StepSequencer` - run a step list with pads, repeats and cancellation
//! - `StepList` - editable, persistable step list
//! - Storage implementations for command history and finished runs (memory, file)

pub mod sequencer;
pub mod steps;
pub mod storage;

pub use sequencer::{RunOptions, RunReport, SequencerError, StepSequencer};
pub use steps::{EditError, StepList};


//! Remote shell adapters.
//!
//! `SshShell` keeps one SSH session and runs each command on its own channel;
//! `ScriptedShell` answers from canned outputs for offline runs and tests.

pub mod scripted;
pub mod ssh;

pub use scripted::ScriptedShell;
pub use ssh::SshShell;

//! Core abstractions for driving a device UI over remote channels.
//!
//! This crate provides the fundamental building blocks:
//! - `TargetCommand` - `Path=Value` command strings
//! - `Step` / `StepResult` / `RunLog` - the scripted run model
//! - `EventStore` - broadcast + history of run progress
//! - `Settings` - environment-driven configuration
//! - Transport, shell, catalog and storage traits

pub mod catalog;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod result;
pub mod step;
pub mod traits;

pub use catalog::{Catalog, MemoryCatalog, Widget, WidgetAttribute};
pub use command::TargetCommand;
pub use config::{
    ConnectionProfile, DeviceTopics, Settings, ShellCredential, ShellTarget, Topics,
};
pub use error::{
    CommandError, ConfigError, ConnectionError, ImportError, MalformedStepError, StorageError,
};
pub use events::{EventStore, RunEvent};
pub use result::{
    Routed, RunLog, RunLogBuilder, StepResult, StepStatus, TransportKind, render_value,
};
pub use step::{Step, StepAction, StepKind};
pub use traits::{
    CommandRecord, ConnectionState, HistoryStorage, InboundMessage, MessageHandler,
    MessageTransport, RemoteShell, RunFilter, RunId, RunState, RunStorage, ShellOutput,
    StoredRun,
};

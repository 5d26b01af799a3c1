//! Command execution on top of the transport and the remote shell.
//!
//! - `CommandAdapter` - routes commands over MQTT or falls back to the shell
//! - `command` - the device's `ec` command vocabulary
//! - `DeviceManager` - firmware updates and test plans per device id
//! - `suggest` - catalog-driven step suggestions

pub mod adapter;
pub mod command;
pub mod device;
pub mod suggest;

pub use adapter::{AdapterError, CommandAdapter, DEFAULT_RESPONSE_TIMEOUT};
pub use command::{CommandBuildError, CommandBuilder};
pub use device::{DeviceError, DeviceManager};
pub use suggest::{SuggestError, suggest_steps, target_for};

//! `<TargetPath>=<Value>` command strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MalformedStepError;

/// Separator between target path and value.
pub const SEPARATOR: char = '=';

/// Prefix of widget addresses on the current page.
pub const WIDGET_PREFIX: &str = "Page.Widgets";

/// A value assignment to a dotted target path, e.g. `Page.Widgets.Pump1.IsSet=1`.
///
/// Parsing splits on the first `=`, so values may themselves contain `=`
/// and `to_string` reproduces the original text exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetCommand {
    pub path: String,
    pub value: String,
}

impl TargetCommand {
    #[must_use]
    pub fn new(path: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
        }
    }

    /// Address a widget property on the current page.
    #[must_use]
    pub fn widget(widget: &str, property: &str, value: impl Into<String>) -> Self {
        Self::new(format!("{WIDGET_PREFIX}.{widget}.{property}"), value)
    }

    /// Parse free text into a command.
    ///
    /// # Errors
    /// Returns error if the separator is missing or the path is empty.
    pub fn parse(text: &str) -> Result<Self, MalformedStepError> {
        let (path, value) = text
            .split_once(SEPARATOR)
            .ok_or_else(|| MalformedStepError::MissingSeparator(text.to_string()))?;
        if path.trim().is_empty() {
            return Err(MalformedStepError::EmptyTarget(text.to_string()));
        }
        Ok(Self::new(path, value))
    }

    /// Path segments of the target address.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('.')
    }
}

impl fmt::Display for TargetCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.path, self.value)
    }
}

impl FromStr for TargetCommand {
    type Err = MalformedStepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

//! Device command vocabulary.
//!
//! The device's `ec` tool accepts a target assignment, input simulation and a
//! few queries. Everything here produces the single command string handed to
//! the remote shell.

use std::borrow::Cow;

use serde::Deserialize;
use thiserror::Error;
use uisee_core::TargetCommand;

/// Device control program.
pub const EC: &str = "ec";

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Failed to quote command: {0}")]
    QuoteError(#[from] shlex::QuoteError),
    #[error("Input name is empty")]
    EmptyInput,
    #[error("Input value is empty")]
    EmptyValue,
    #[error("Input config is not a JSON list: {0}")]
    InputConfig(#[from] serde_json::Error),
}

/// Builder for `ec` invocations; parameters are shell-quoted on build.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Base executable.
    pub base: String,
    /// Parameters appended after the base.
    pub params: Vec<String>,
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new(EC)
    }
}

impl CommandBuilder {
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    /// Render as one shell command line.
    ///
    /// # Errors
    /// Returns error if a parameter cannot be quoted.
    pub fn build(&self) -> Result<String, CommandBuildError> {
        let words = std::iter::once(self.base.as_str()).chain(self.params.iter().map(String::as_str));
        Ok(shlex::try_join(words)?)
    }
}

/// `ec <TargetPath>=<Value>`, the shell equivalent of a published command.
///
/// The assignment is left bare unless it holds characters the shell would
/// interpret.
///
/// # Errors
/// Returns error if the text contains a NUL byte.
pub fn assign(target: &TargetCommand) -> Result<String, CommandBuildError> {
    let text = target.to_string();
    let word: Cow<'_, str> = if text.chars().all(is_bare) {
        Cow::Borrowed(text.as_str())
    } else {
        shlex::try_quote(&text)?
    };
    Ok(format!("{EC} {word}"))
}

const fn is_bare(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '=' | '/' | ':' | ',' | '+' | '@' | '%')
}

/// `ec -s simin <input> <value>`.
///
/// # Errors
/// Returns error if either argument is empty.
pub fn simulate_input(input: &str, value: &str) -> Result<String, CommandBuildError> {
    let (input, value) = (input.trim(), value.trim());
    if input.is_empty() {
        return Err(CommandBuildError::EmptyInput);
    }
    if value.is_empty() {
        return Err(CommandBuildError::EmptyValue);
    }
    CommandBuilder::default()
        .params(["-s", "simin", input, value])
        .build()
}

/// `ec get_input_config`.
#[must_use]
pub fn input_config() -> String {
    format!("{EC} get_input_config")
}

/// `ec detect_current_screen`.
#[must_use]
pub fn current_screen() -> String {
    format!("{EC} detect_current_screen")
}

#[derive(Deserialize)]
struct InputEntry {
    name: Option<String>,
}

/// Names of the inputs listed by `ec get_input_config`.
///
/// Entries without a name are skipped; blank output means no inputs.
///
/// # Errors
/// Returns error if the output is not a JSON list of objects.
pub fn parse_input_config(stdout: &str) -> Result<Vec<String>, CommandBuildError> {
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<InputEntry> = serde_json::from_str(stdout)?;
    Ok(entries.into_iter().filter_map(|e| e.name).collect())
}

//! Scripted steps and their persisted form.
//!
//! A step serializes as `{"type": "mqtt"|"ssh"|"wait", "command"|"value", "pre_wait"?, "post_wait"?}`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::TargetCommand;
use crate::error::MalformedStepError;

/// Pad applied before and after each step unless overridden.
pub const DEFAULT_PAD: Duration = Duration::from_secs(2);

/// Step type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Mqtt,
    Ssh,
    Wait,
}

impl StepKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mqtt => "mqtt",
            Self::Ssh => "ssh",
            Self::Wait => "wait",
        }
    }
}

impl std::str::FromStr for StepKind {
    type Err = MalformedStepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Ok(Self::Mqtt),
            "ssh" => Ok(Self::Ssh),
            "wait" => Ok(Self::Wait),
            other => Err(MalformedStepError::UnknownKind(other.to_string())),
        }
    }
}

/// The action a step performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StepAction {
    /// Publish `Path=Value` and wait for the acknowledgement.
    ///
    /// The raw text is kept as authored; it is parsed when the step runs.
    #[serde(rename = "mqtt")]
    PublishAndWait { command: String },
    /// Run a command over the remote shell.
    #[serde(rename = "ssh")]
    RemoteExec { command: String },
    /// Sleep for a number of seconds.
    #[serde(rename = "wait")]
    Wait {
        #[serde(rename = "value")]
        seconds: f64,
    },
}

/// One scripted action plus its pre/post pads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub action: StepAction,
    /// Seconds to sleep before the action. Defaults to 2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_wait: Option<f64>,
    /// Seconds to sleep after the action. Defaults to 2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_wait: Option<f64>,
}

impl Step {
    #[must_use]
    pub const fn new(action: StepAction) -> Self {
        Self {
            action,
            pre_wait: None,
            post_wait: None,
        }
    }

    /// Well-formed publish step for `path=value`.
    #[must_use]
    pub fn publish(path: &str, value: &str) -> Self {
        Self::new(StepAction::PublishAndWait {
            command: TargetCommand::new(path, value).to_string(),
        })
    }

    /// Publish step from raw `Path=Value` text, malformed or not.
    #[must_use]
    pub fn publish_text(text: impl Into<String>) -> Self {
        Self::new(StepAction::PublishAndWait {
            command: text.into(),
        })
    }

    #[must_use]
    pub fn remote_exec(command: impl Into<String>) -> Self {
        Self::new(StepAction::RemoteExec {
            command: command.into(),
        })
    }

    #[must_use]
    pub const fn wait(seconds: f64) -> Self {
        Self::new(StepAction::Wait { seconds })
    }

    /// Build a step from the free-text builder form.
    ///
    /// For `wait`, the first whitespace token is the number of seconds, so
    /// `"10 sec"` and `"10"` are both accepted.
    ///
    /// # Errors
    /// Returns error if the text is empty or the wait value is not a number.
    pub fn from_text(kind: StepKind, text: &str) -> Result<Self, MalformedStepError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(MalformedStepError::EmptyCommand);
        }
        match kind {
            StepKind::Mqtt => Ok(Self::publish_text(text)),
            StepKind::Ssh => Ok(Self::remote_exec(text)),
            StepKind::Wait => {
                let token = text.split_whitespace().next().unwrap_or_default();
                let seconds: f64 = token
                    .parse()
                    .map_err(|_| MalformedStepError::InvalidWait(text.to_string()))?;
                if Duration::try_from_secs_f64(seconds).is_err() {
                    return Err(MalformedStepError::InvalidWait(text.to_string()));
                }
                Ok(Self::wait(seconds))
            }
        }
    }

    #[must_use]
    pub const fn with_pre_wait(mut self, seconds: f64) -> Self {
        self.pre_wait = Some(seconds);
        self
    }

    #[must_use]
    pub const fn with_post_wait(mut self, seconds: f64) -> Self {
        self.post_wait = Some(seconds);
        self
    }

    #[must_use]
    pub const fn kind(&self) -> StepKind {
        match self.action {
            StepAction::PublishAndWait { .. } => StepKind::Mqtt,
            StepAction::RemoteExec { .. } => StepKind::Ssh,
            StepAction::Wait { .. } => StepKind::Wait,
        }
    }

    /// Command or value rendered the way the run log shows it.
    #[must_use]
    pub fn display_text(&self) -> String {
        match &self.action {
            StepAction::PublishAndWait { command } | StepAction::RemoteExec { command } => {
                command.clone()
            }
            StepAction::Wait { seconds } => seconds.to_string(),
        }
    }

    #[must_use]
    pub fn pre_wait(&self) -> Duration {
        pad(self.pre_wait)
    }

    #[must_use]
    pub fn post_wait(&self) -> Duration {
        pad(self.post_wait)
    }

    /// Structural check applied on import.
    ///
    /// Publish commands without `=` pass here; they are reported as
    /// `invalid` when the step runs.
    ///
    /// # Errors
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        match &self.action {
            StepAction::PublishAndWait { command } | StepAction::RemoteExec { command } => {
                if command.trim().is_empty() {
                    return Err(format!("`{}` step has an empty command", self.kind().as_str()));
                }
            }
            StepAction::Wait { seconds } => check_seconds("value", *seconds)?,
        }
        if let Some(pre) = self.pre_wait {
            check_seconds("pre_wait", pre)?;
        }
        if let Some(post) = self.post_wait {
            check_seconds("post_wait", post)?;
        }
        Ok(())
    }
}

fn pad(seconds: Option<f64>) -> Duration {
    match seconds.map(Duration::try_from_secs_f64) {
        None => DEFAULT_PAD,
        Some(Ok(duration)) => duration,
        Some(Err(e)) => {
            tracing::warn!(seconds = ?seconds, error = %e, "Unusable pad, using the default");
            DEFAULT_PAD
        }
    }
}

/// Accept only values that convert to a [`Duration`]: finite, non-negative, in range.
fn check_seconds(field: &str, seconds: f64) -> Result<(), String> {
    Duration::try_from_secs_f64(seconds).map(|_| ()).map_err(|e| {
        format!("`{field}` must be a non-negative number of seconds, got {seconds} ({e})")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persisted_shape() {
        let step = Step::publish("Page.Widgets.Pump1.IsSet", "1").with_pre_wait(1.0);
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "mqtt", "command": "Page.Widgets.Pump1.IsSet=1", "pre_wait": 1.0})
        );

        let wait = serde_json::to_value(Step::wait(10.0)).unwrap();
        assert_eq!(wait, serde_json::json!({"type": "wait", "value": 10.0}));
    }

    #[test]
    fn test_parse_integer_wait() {
        let step: Step = serde_json::from_str(r#"{"type": "wait", "value": 10}"#).unwrap();
        assert_eq!(step.action, StepAction::Wait { seconds: 10.0 });
        assert_eq!(step.pre_wait(), DEFAULT_PAD);
    }

    #[test]
    fn test_from_text() {
        assert_eq!(Step::from_text(StepKind::Wait, "10 sec").unwrap(), Step::wait(10.0));
        assert_eq!(
            Step::from_text(StepKind::Ssh, " ec simin a_tra1 55.5 ").unwrap(),
            Step::remote_exec("ec simin a_tra1 55.5")
        );
        assert!(matches!(
            Step::from_text(StepKind::Wait, "soon"),
            Err(MalformedStepError::InvalidWait(_))
        ));
        assert!(matches!(
            Step::from_text(StepKind::Mqtt, "  "),
            Err(MalformedStepError::EmptyCommand)
        ));
    }

    #[test]
    fn test_validate_rejects_negative_pads() {
        let step = Step::wait(1.0).with_post_wait(-1.0);
        assert!(step.validate().is_err());
        assert!(Step::wait(f64::NAN).validate().is_err());
        assert!(Step::publish_text("no separator").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_seconds() {
        let wait: Step = serde_json::from_str(r#"{"type": "wait", "value": 1e300}"#).unwrap();
        assert!(wait.validate().unwrap_err().contains("`value`"));

        let padded: Step =
            serde_json::from_str(r#"{"type": "ssh", "command": "uptime", "pre_wait": 1e300}"#)
                .unwrap();
        assert!(padded.validate().unwrap_err().contains("`pre_wait`"));

        assert!(matches!(
            Step::from_text(StepKind::Wait, "1e300"),
            Err(MalformedStepError::InvalidWait(_))
        ));
        assert!(Step::wait(0.0).with_post_wait(86_400.0).validate().is_ok());
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("MQTT".parse::<StepKind>().unwrap(), StepKind::Mqtt);
        assert!("http".parse::<StepKind>().is_err());
    }
}

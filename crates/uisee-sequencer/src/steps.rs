//! Editable step list and its persisted form.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uisee_core::{ImportError, Step};

/// Step list edit error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    #[error("Step index {index} out of range (list has {len} steps)")]
    OutOfRange { index: usize, len: usize },
}

/// Ordered list of steps, persisted as a JSON array of step records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepList {
    steps: Vec<Step>,
}

impl StepList {
    #[must_use]
    pub const fn new() -> Self {
        Self { steps: Vec::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Step] {
        &self.steps
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Step> {
        self.steps.iter()
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Insert before `index`; `index == len` appends.
    ///
    /// # Errors
    /// Returns error if `index > len`.
    pub fn insert(&mut self, index: usize, step: Step) -> Result<(), EditError> {
        if index > self.steps.len() {
            return Err(self.out_of_range(index));
        }
        self.steps.insert(index, step);
        Ok(())
    }

    /// # Errors
    /// Returns error if `index` is out of range.
    pub fn remove(&mut self, index: usize) -> Result<Step, EditError> {
        if index >= self.steps.len() {
            return Err(self.out_of_range(index));
        }
        Ok(self.steps.remove(index))
    }

    /// Replace the step at `index`, returning the old one.
    ///
    /// # Errors
    /// Returns error if `index` is out of range.
    pub fn replace(&mut self, index: usize, step: Step) -> Result<Step, EditError> {
        let len = self.steps.len();
        let slot = self
            .steps
            .get_mut(index)
            .ok_or(EditError::OutOfRange { index, len })?;
        Ok(std::mem::replace(slot, step))
    }

    /// Move a step so it ends up at position `to`.
    ///
    /// # Errors
    /// Returns error if either index is out of range.
    pub fn move_step(&mut self, from: usize, to: usize) -> Result<(), EditError> {
        let len = self.steps.len();
        if from >= len {
            return Err(self.out_of_range(from));
        }
        if to >= len {
            return Err(self.out_of_range(to));
        }
        let step = self.steps.remove(from);
        self.steps.insert(to, step);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }

    const fn out_of_range(&self, index: usize) -> EditError {
        EditError::OutOfRange {
            index,
            len: self.steps.len(),
        }
    }

    /// Serialize as a pretty JSON array.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.steps)
    }

    /// Parse and validate a persisted step list.
    ///
    /// All-or-nothing: the first bad record fails the whole import.
    ///
    /// # Errors
    /// Returns `Parse` if the document is not a JSON array, `Invalid` naming
    /// the first record that is not a well-formed step.
    pub fn from_json(json: &str) -> Result<Self, ImportError> {
        let records: Vec<Value> = serde_json::from_str(json)?;
        let steps = records
            .into_iter()
            .enumerate()
            .map(|(index, record)| {
                let step: Step = serde_json::from_value(record).map_err(|e| ImportError::Invalid {
                    index,
                    reason: e.to_string(),
                })?;
                step.validate()
                    .map_err(|reason| ImportError::Invalid { index, reason })?;
                Ok(step)
            })
            .collect::<Result<Vec<_>, ImportError>>()?;
        Ok(Self { steps })
    }

    /// Write the list to `path`, replacing it atomically.
    ///
    /// # Errors
    /// Returns error if the file cannot be written.
    pub async fn save(&self, path: &Path) -> Result<(), ImportError> {
        let json = self.to_json()?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::debug!(path = %path.display(), steps = self.len(), "Step list saved");
        Ok(())
    }

    /// Read a list written by [`StepList::save`].
    ///
    /// # Errors
    /// Returns error if the file cannot be read or does not validate.
    pub async fn load(path: &Path) -> Result<Self, ImportError> {
        let json = tokio::fs::read_to_string(path).await?;
        let list = Self::from_json(&json)?;
        tracing::debug!(path = %path.display(), steps = list.len(), "Step list loaded");
        Ok(list)
    }
}

impl From<Vec<Step>> for StepList {
    fn from(steps: Vec<Step>) -> Self {
        Self { steps }
    }
}

impl FromIterator<Step> for StepList {
    fn from_iter<I: IntoIterator<Item = Step>>(iter: I) -> Self {
        Self {
            steps: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a StepList {
    type Item = &'a Step;
    type IntoIter = std::slice::Iter<'a, Step>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

#[cfg(test)]
mod tests {
    use uisee_core::StepKind;

    use super::*;

    fn sample() -> StepList {
        StepList::from(vec![
            Step::publish("Page.Widgets.Pump1.IsSet", "1"),
            Step::wait(5.0),
            Step::remote_exec("ec simin a_tra1 55.5")
                .with_pre_wait(0.5)
                .with_post_wait(3.0),
        ])
    }

    #[test]
    fn test_editing() {
        let mut list = sample();
        list.insert(0, Step::wait(1.0)).unwrap();
        assert_eq!(list.get(0).unwrap().kind(), StepKind::Wait);

        list.move_step(0, 3).unwrap();
        assert_eq!(list.get(3).unwrap().display_text(), "1");
        assert_eq!(list.get(0).unwrap().kind(), StepKind::Mqtt);

        let old = list.replace(1, Step::wait(2.0)).unwrap();
        assert_eq!(old.display_text(), "5");

        let removed = list.remove(2).unwrap();
        assert_eq!(removed.kind(), StepKind::Ssh);
        assert_eq!(list.len(), 3);

        assert_eq!(
            list.remove(7),
            Err(EditError::OutOfRange { index: 7, len: 3 })
        );
        assert!(list.insert(4, Step::wait(1.0)).is_err());
        assert!(list.move_step(0, 3).is_err());

        list.clear();
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steps.json");
        let mut list = sample();
        list.push(Step::publish_text("Page.Widgets.Broken"));

        list.save(&path).await.unwrap();
        let loaded = StepList::load(&path).await.unwrap();
        assert_eq!(loaded, list);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_import_accepts_persisted_records() {
        let json = r#"[
            {"type": "mqtt", "command": "Page.Widgets.Pump1.IsSet=1"},
            {"type": "wait", "value": 5},
            {"type": "ssh", "command": "ec simin a_tra1 55.5", "pre_wait": 2, "post_wait": 2}
        ]"#;
        let list = StepList::from_json(json).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.get(2).unwrap().post_wait().as_secs(), 2);
    }

    #[test]
    fn test_import_is_atomic() {
        let bad_type = r#"[{"type": "wait", "value": 1}, {"type": "simin", "command": "a 1"}]"#;
        assert!(matches!(
            StepList::from_json(bad_type),
            Err(ImportError::Invalid { index: 1, .. })
        ));

        let missing_field = r#"[{"type": "ssh"}]"#;
        assert!(matches!(
            StepList::from_json(missing_field),
            Err(ImportError::Invalid { index: 0, .. })
        ));

        let negative_wait = r#"[{"type": "mqtt", "command": "A=1"}, {"type": "wait", "value": -3}]"#;
        assert!(matches!(
            StepList::from_json(negative_wait),
            Err(ImportError::Invalid { index: 1, .. })
        ));

        let huge_pad = r#"[{"type": "wait", "value": 1, "post_wait": 1e300}]"#;
        assert!(matches!(
            StepList::from_json(huge_pad),
            Err(ImportError::Invalid { index: 0, .. })
        ));

        assert!(matches!(
            StepList::from_json(r#"{"type": "wait"}"#),
            Err(ImportError::Parse(_))
        ));
    }
}

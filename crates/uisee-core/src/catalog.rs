//! Lookup interface to the UI catalog.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// A widget declared on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Widget {
    pub page: String,
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
}

/// A property of a widget, with its declared default if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetAttribute {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// Read access to the parsed page/widget catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Widgets on a page.
    async fn widgets(&self, page: &str) -> Result<Vec<Widget>, StorageError>;

    /// Attributes of one widget.
    async fn attributes(&self, page: &str, widget: &str)
    -> Result<Vec<WidgetAttribute>, StorageError>;
}

/// Catalog held in memory.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    pages: RwLock<BTreeMap<String, BTreeMap<String, (Widget, Vec<WidgetAttribute>)>>>,
}

impl MemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a widget and its attributes.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn insert(
        &self,
        widget: Widget,
        attributes: Vec<WidgetAttribute>,
    ) -> Result<(), StorageError> {
        self.pages
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .entry(widget.page.clone())
            .or_default()
            .insert(widget.name.clone(), (widget, attributes));
        Ok(())
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn widgets(&self, page: &str) -> Result<Vec<Widget>, StorageError> {
        Ok(self
            .pages
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(page)
            .map(|widgets| widgets.values().map(|(w, _)| w.clone()).collect())
            .unwrap_or_default())
    }

    async fn attributes(
        &self,
        page: &str,
        widget: &str,
    ) -> Result<Vec<WidgetAttribute>, StorageError> {
        Ok(self
            .pages
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(page)
            .and_then(|widgets| widgets.get(widget))
            .map(|(_, attrs)| attrs.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_by_page_and_widget() {
        let catalog = MemoryCatalog::new();
        catalog
            .insert(
                Widget {
                    page: "Home".into(),
                    name: "Pump1Button".into(),
                    kind: Some("Button".into()),
                },
                vec![WidgetAttribute {
                    name: "IsSet".into(),
                    value: Some("0".into()),
                }],
            )
            .unwrap();

        let widgets = catalog.widgets("Home").await.unwrap();
        assert_eq!(widgets.len(), 1);
        assert_eq!(widgets[0].name, "Pump1Button");

        let attrs = catalog.attributes("Home", "Pump1Button").await.unwrap();
        assert_eq!(attrs[0].name, "IsSet");

        assert!(catalog.widgets("Missing").await.unwrap().is_empty());
        assert!(catalog.attributes("Home", "Nope").await.unwrap().is_empty());
    }
}

//! Catalog-driven step suggestions.

use thiserror::Error;
use uisee_core::{Catalog, Step, StorageError, TargetCommand};

/// Suggestion error.
#[derive(Debug, Error)]
pub enum SuggestError {
    #[error(transparent)]
    Catalog(#[from] StorageError),
    #[error("Widget `{widget}` on page `{page}` has no attribute `{attribute}`")]
    UnknownAttribute {
        page: String,
        widget: String,
        attribute: String,
    },
}

/// Well-known action for a widget, by name.
fn suggestion_for(widget: &str) -> Option<(&'static str, &'static str)> {
    if widget.contains("Button") {
        Some(("IsSet", "1"))
    } else if widget.contains("Selection") {
        Some(("SelectedIndex", "0"))
    } else {
        None
    }
}

/// One publish step per widget on `page` that has a well-known action.
///
/// # Errors
/// Returns error if the catalog lookup fails.
pub async fn suggest_steps(catalog: &dyn Catalog, page: &str) -> Result<Vec<Step>, StorageError> {
    let widgets = catalog.widgets(page).await?;
    let steps: Vec<Step> = widgets
        .iter()
        .filter_map(|w| {
            suggestion_for(&w.name).map(|(property, value)| {
                let target = TargetCommand::widget(&w.name, property, value);
                Step::publish(&target.path, &target.value)
            })
        })
        .collect();
    tracing::debug!(page, widgets = widgets.len(), steps = steps.len(), "Suggested steps built");
    Ok(steps)
}

/// Publish step for `widget.attribute = value`, checked against the catalog.
///
/// # Errors
/// Returns error if the lookup fails or the attribute is not declared.
pub async fn target_for(
    catalog: &dyn Catalog,
    page: &str,
    widget: &str,
    attribute: &str,
    value: &str,
) -> Result<Step, SuggestError> {
    let attributes = catalog.attributes(page, widget).await?;
    if !attributes.iter().any(|a| a.name == attribute) {
        return Err(SuggestError::UnknownAttribute {
            page: page.to_string(),
            widget: widget.to_string(),
            attribute: attribute.to_string(),
        });
    }
    let target = TargetCommand::widget(widget, attribute, value);
    Ok(Step::publish(&target.path, &target.value))
}

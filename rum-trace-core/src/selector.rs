//! DOM event selector rules
//!
//! An [`EventSelector`] decides whether an event target (or, with bubbling,
//! one of its ancestors) is interesting, and extracts configured attributes
//! of the matched element into a flat key/value map.

use crate::config::EventSelectorConfig;
use crate::dom::{DomTree, ElementProperty, NodeId};
use crate::types::{Result, TraceError};
use std::collections::BTreeMap;

/// Pseudo-attribute resolved through an associated `<label for=...>`
pub const LABEL_ATTRIBUTE: &str = "$label";

/// Compiled selector rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSelector {
    events: Vec<String>,
    selector: String,
    attributes_to_extract: Vec<String>,
    always_relevant: bool,
    consider_bubbling: bool,
    storage_prefix: String,
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl EventSelector {
    /// Compile a rule from its configuration
    pub fn from_config(config: &EventSelectorConfig) -> Result<Self> {
        let selector = config.selector.trim();
        if selector.is_empty() {
            return Err(TraceError::InvalidSelector("empty selector".to_string()));
        }
        let events = split_list(&config.events_list);
        if events.is_empty() {
            return Err(TraceError::InvalidSelector(format!("no events for selector {:?}", selector)));
        }

        Ok(Self {
            events,
            selector: selector.to_string(),
            attributes_to_extract: split_list(&config.attributes_to_extract_list),
            always_relevant: config.always_relevant,
            consider_bubbling: config.consider_bubbling,
            storage_prefix: config.storage_prefix.trim().to_string(),
        })
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub fn always_relevant(&self) -> bool {
        self.always_relevant
    }

    pub fn considers_bubbling(&self) -> bool {
        self.consider_bubbling
    }

    /// True if the rule is configured for `event_type`
    pub fn applies_to(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == event_type)
    }

    /// The node itself if it matches, else (with bubbling) the nearest
    /// matching ancestor element
    pub fn matches_element(&self, dom: &dyn DomTree, node: NodeId) -> Option<NodeId> {
        if dom.is_element(node) && dom.matches_selector(node, &self.selector) {
            return Some(node);
        }
        if !self.consider_bubbling {
            return None;
        }

        let mut current = dom.parent_node(node);
        while let Some(ancestor) = current {
            if dom.is_element(ancestor) && dom.matches_selector(ancestor, &self.selector) {
                return Some(ancestor);
            }
            current = dom.parent_node(ancestor);
        }
        None
    }

    fn storage_key(&self, attribute: &str) -> String {
        if self.storage_prefix.is_empty() {
            attribute.to_string()
        } else {
            format!("{}.{}", self.storage_prefix, attribute)
        }
    }

    /// Extract configured attributes of `element` into `storage`
    ///
    /// Keys already present in `storage` are left untouched.
    pub fn extract_attributes(&self, dom: &dyn DomTree, element: NodeId, storage: &mut BTreeMap<String, String>) {
        for attribute in &self.attributes_to_extract {
            let key = self.storage_key(attribute);
            if storage.contains_key(&key) {
                continue;
            }

            let value = if attribute == LABEL_ATTRIBUTE {
                label_text(dom, element)
            } else if let Some(literal) = dom.attribute(element, attribute) {
                Some(literal)
            } else {
                ElementProperty::from_name(attribute)
                    .and_then(|p| dom.property(element, p))
                    .filter(|v| !v.is_empty())
            };

            if let Some(value) = value {
                storage.insert(key, value);
            }
        }
    }
}

/// Text of the `<label>` next to `element` whose `for` equals its id
fn label_text(dom: &dyn DomTree, element: NodeId) -> Option<String> {
    let id = dom.attribute(element, "id").filter(|id| !id.is_empty())?;
    let parent = dom.parent_element(element)?;
    dom.elements_by_tag_name(parent, "label")
        .into_iter()
        .find(|label| dom.attribute(*label, "for").as_deref() == Some(id.as_str()))
        .map(|label| dom.inner_text(label))
        .filter(|text| !text.is_empty())
}

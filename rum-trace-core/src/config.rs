//! Agent configuration types
//!
//! This module defines the settings object the page exposes before the agent
//! boots. Everything is plain serde data so the same structure can be read
//! from an injected JSON snippet or a TOML file.

use serde::{Deserialize, Serialize};

/// Settings for one agent instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Stay inactive when the browser sends a do-not-track signal
    #[serde(default = "default_true")]
    pub respect_dnt: bool,

    /// Backend-issued trace id of the request that delivered this page
    #[serde(default)]
    pub trace_id: Option<String>,

    /// Delay before plugins' deferred init runs (default: 50ms)
    #[serde(default = "default_async_init_delay")]
    pub async_init_delay_ms: u64,

    /// DOM event selector rules used for listener attribution
    #[serde(default)]
    pub selectors: Vec<EventSelectorConfig>,
}

fn default_true() -> bool {
    true
}

fn default_async_init_delay() -> u64 {
    50
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            respect_dnt: true,
            trace_id: None,
            async_init_delay_ms: default_async_init_delay(),
            selectors: Vec::new(),
        }
    }
}

/// Declarative DOM event selector rule
///
/// List-valued fields are comma separated, matching the format the backend
/// ships to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventSelectorConfig {
    /// Event types this rule applies to, e.g. `"click,submit"`
    pub events_list: String,
    /// Element selector
    pub selector: String,
    /// Attributes to extract, e.g. `"id,$label,value"`
    #[serde(default)]
    pub attributes_to_extract_list: String,
    /// Mark matching listener executions relevant unconditionally
    #[serde(default)]
    pub always_relevant: bool,
    /// Also match ancestors of the event target
    #[serde(default)]
    pub consider_bubbling: bool,
    /// Prefix for extracted attribute keys (`prefix.attribute`)
    #[serde(default)]
    pub storage_prefix: String,
}

impl EventSelectorConfig {
    /// Create a rule for `selector` firing on `events_list`
    pub fn new(events_list: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            events_list: events_list.into(),
            selector: selector.into(),
            attributes_to_extract_list: String::new(),
            always_relevant: false,
            consider_bubbling: false,
            storage_prefix: String::new(),
        }
    }

    /// Builder method: set the attributes to extract
    pub fn with_attributes(mut self, attributes: impl Into<String>) -> Self {
        self.attributes_to_extract_list = attributes.into();
        self
    }

    /// Builder method: mark matches as always relevant
    pub fn with_always_relevant(mut self, enabled: bool) -> Self {
        self.always_relevant = enabled;
        self
    }

    /// Builder method: consider ancestors of the event target
    pub fn with_bubbling(mut self, enabled: bool) -> Self {
        self.consider_bubbling = enabled;
        self
    }

    /// Builder method: set the storage prefix
    pub fn with_storage_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.storage_prefix = prefix.into();
        self
    }
}

impl AgentSettings {
    /// Create settings with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: respect or ignore the do-not-track signal
    pub fn with_respect_dnt(mut self, enabled: bool) -> Self {
        self.respect_dnt = enabled;
        self
    }

    /// Builder method: set the backend-issued trace id
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Builder method: set the deferred init delay
    pub fn with_async_init_delay(mut self, delay_ms: u64) -> Self {
        self.async_init_delay_ms = delay_ms;
        self
    }

    /// Builder method: add a selector rule
    pub fn add_selector(mut self, selector: EventSelectorConfig) -> Self {
        self.selectors.push(selector);
        self
    }

    /// Parse settings from the JSON snippet injected into the page
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// True if `value` is a do-not-track opt-out signal
    pub fn is_opt_out_signal(value: &str) -> bool {
        matches!(value.trim(), "1" | "yes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_builder() {
        let settings = AgentSettings::new()
            .with_respect_dnt(false)
            .with_trace_id("abc123")
            .with_async_init_delay(10)
            .add_selector(
                EventSelectorConfig::new("click", "button")
                    .with_attributes("id,$label")
                    .with_bubbling(true)
                    .with_storage_prefix("btn"),
            );

        assert!(!settings.respect_dnt);
        assert_eq!(settings.trace_id.as_deref(), Some("abc123"));
        assert_eq!(settings.async_init_delay_ms, 10);
        assert_eq!(settings.selectors.len(), 1);
        assert!(settings.selectors[0].consider_bubbling);
    }

    #[test]
    fn test_settings_defaults_from_json() {
        let settings = AgentSettings::from_json(
            r#"{ "selectors": [ { "events_list": "click", "selector": "a" } ] }"#,
        )
        .unwrap();

        assert!(settings.respect_dnt);
        assert_eq!(settings.trace_id, None);
        assert_eq!(settings.async_init_delay_ms, 50);
        assert!(!settings.selectors[0].always_relevant);
        assert_eq!(settings.selectors[0].storage_prefix, "");
    }

    #[test]
    fn test_opt_out_signal() {
        assert!(AgentSettings::is_opt_out_signal("1"));
        assert!(AgentSettings::is_opt_out_signal("yes"));
        assert!(!AgentSettings::is_opt_out_signal("0"));
        assert!(!AgentSettings::is_opt_out_signal("unspecified"));
    }
}

//! Scenario and settings loading

use anyhow::{Context, Result};
use rum_trace_core::{AgentSettings, Capability};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// A recorded page session to replay (loaded from scenario.toml)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Scenario {
    pub page: PageConfig,
    #[serde(default)]
    pub elements: Vec<ElementConfig>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Host state at agent start
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PageConfig {
    pub url: String,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    /// Do-not-track value reported by the browser
    pub dnt: Option<String>,
    #[serde(default)]
    pub missing_capabilities: Vec<Capability>,
}

/// One element of the replayed document
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ElementConfig {
    /// Reference used by steps; also set as the element's `id` unless
    /// `attributes` overrides it
    pub id: String,
    pub tag: String,
    /// Reference of the parent element (default: document)
    pub parent: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Runtime properties such as `value` or `checked`
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub text: Option<String>,
}

/// Something a page-script listener does when invoked
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "do", rename_all = "snake_case")]
pub enum ListenerAction {
    PushState { url: String },
    ReplaceState { url: String },
    SetLocation { url: String },
    /// Schedule more actions on a timer
    Timeout {
        ms: u64,
        #[serde(default)]
        actions: Vec<ListenerAction>,
    },
}

/// One replay step
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Register a page-script listener; `target` is `window`, `document` or
    /// an element reference
    Register {
        target: String,
        event: String,
        listener: String,
        #[serde(default)]
        actions: Vec<ListenerAction>,
    },
    Dispatch { target: String, event: String },
    Click { element: String },
    PushState { url: String },
    ReplaceState { url: String },
    SetLocation { url: String },
    /// Run the traversal observers over one element, or every element
    Visit { element: Option<String> },
    /// Advance the clock, running due timers
    Advance { ms: u64 },
    Unload,
}

/// Load a replay scenario from a TOML file
pub fn load_scenario(path: &Path) -> Result<Scenario> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario file: {:?}", path))?;

    let scenario: Scenario = toml::from_str(&content)
        .with_context(|| format!("Failed to parse scenario file: {:?}", path))?;

    Ok(scenario)
}

/// Load agent settings from a TOML file
pub fn load_settings(path: &Path) -> Result<AgentSettings> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {:?}", path))?;

    let settings: AgentSettings = toml::from_str(&content)
        .with_context(|| format!("Failed to parse settings file: {:?}", path))?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SCENARIO: &str = r#"
        [page]
        url = "https://shop.example/cart"
        dnt = "0"
        missing_capabilities = ["selector_engine"]

        [page.cookies]
        inspectIT_traceid_abc123 = "1"

        [[elements]]
        id = "checkout"
        tag = "form"

        [[elements]]
        id = "buy"
        tag = "button"
        parent = "checkout"
        text = "Buy now"

        [[steps]]
        action = "register"
        target = "buy"
        event = "click"
        listener = "onBuy"
        actions = [
            { do = "push_state", url = "/checkout" },
            { do = "timeout", ms = 20, actions = [{ do = "replace_state", url = "/checkout?step=2" }] },
        ]

        [[steps]]
        action = "click"
        element = "buy"

        [[steps]]
        action = "advance"
        ms = 20

        [[steps]]
        action = "unload"
    "#;

    #[test]
    fn test_scenario_deserialization() {
        let scenario: Scenario = toml::from_str(SCENARIO).unwrap();

        assert_eq!(scenario.page.cookies.len(), 1);
        assert_eq!(scenario.page.missing_capabilities, vec![Capability::SelectorEngine]);
        assert_eq!(scenario.elements[1].parent.as_deref(), Some("checkout"));
        assert_eq!(scenario.steps.len(), 4);
        assert_eq!(scenario.steps[3], Step::Unload);
        match &scenario.steps[0] {
            Step::Register { actions, .. } => {
                assert_eq!(actions.len(), 2);
                assert!(matches!(&actions[1], ListenerAction::Timeout { ms: 20, actions } if actions.len() == 1));
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_load_scenario_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SCENARIO.as_bytes()).unwrap();

        let scenario = load_scenario(file.path()).unwrap();
        assert_eq!(scenario.page.url, "https://shop.example/cart");
    }

    #[test]
    fn test_load_settings_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            respect_dnt = false
            trace_id = "abc123"

            [[selectors]]
            events_list = "click"
            selector = "button"
            attributes_to_extract_list = "id,$label"
            always_relevant = true
            "#
        )
        .unwrap();

        let settings = load_settings(file.path()).unwrap();
        assert!(!settings.respect_dnt);
        assert_eq!(settings.trace_id.as_deref(), Some("abc123"));
        assert_eq!(settings.async_init_delay_ms, 50);
        assert_eq!(settings.selectors.len(), 1);
        assert!(settings.selectors[0].always_relevant);
    }

    #[test]
    fn test_load_errors_carry_context() {
        let missing = load_scenario(Path::new("/nonexistent/scenario.toml")).unwrap_err();
        assert!(missing.to_string().contains("Failed to read scenario file"));

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[page]\nurl = 3\n").unwrap();
        let invalid = load_scenario(file.path()).unwrap_err();
        assert!(invalid.to_string().contains("Failed to parse scenario file"));
    }
}

//! Scenario replay against the in-memory host

use crate::config::{ElementConfig, ListenerAction, PageConfig, Scenario, Step};
use anyhow::{bail, Context, Result};
use rum_trace_core::{
    Agent, AgentSettings, AgentState, ElementProperty, Event, EventTarget, Host, Listener, MemoryDom, MemoryHost,
    NodeId, Transport,
};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// Outcome of a replay run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub steps: usize,
    pub traces: usize,
    pub open_records: usize,
    pub state: AgentState,
}

/// A booted agent on a host built from a scenario
pub struct Replay {
    host: Rc<MemoryHost>,
    agent: Agent,
    elements: HashMap<String, NodeId>,
    element_order: Vec<NodeId>,
}

impl Replay {
    /// Build the host, boot the agent with the default plugins
    pub fn new(scenario: &Scenario, settings: AgentSettings, transport: Box<dyn Transport>) -> Result<Self> {
        let (dom, elements, element_order) = build_dom(&scenario.elements)?;
        let host = Rc::new(build_host(&scenario.page, dom));

        let agent = Agent::new(host.clone(), settings, transport);
        agent
            .register_default_plugins()
            .context("Invalid event selector configuration")?;
        let state = agent.init();
        log::info!("Agent {} on {}", state, scenario.page.url);

        Ok(Self {
            host,
            agent,
            elements,
            element_order,
        })
    }

    #[cfg(test)]
    pub fn host(&self) -> &Rc<MemoryHost> {
        &self.host
    }

    /// Run every step in order
    pub fn run(&self, steps: &[Step]) -> Result<ReplaySummary> {
        for (index, step) in steps.iter().enumerate() {
            log::debug!("Step {}: {:?}", index + 1, step);
            self.apply(step)
                .with_context(|| format!("Step {} failed", index + 1))?;
        }

        let summary = ReplaySummary {
            steps: steps.len(),
            traces: self.agent.tracer().flushed_traces(),
            open_records: self.agent.tracer().open_records(),
            state: self.agent.state(),
        };
        if summary.state != AgentState::Unloading && summary.open_records > 0 {
            log::info!("No unload step, {} record(s) still open", summary.open_records);
        }
        Ok(summary)
    }

    fn apply(&self, step: &Step) -> Result<()> {
        let host = &self.host;
        match step {
            Step::Register {
                target,
                event,
                listener,
                actions,
            } => {
                let target = self.target(target)?;
                host.add_event_listener(&target, event, page_listener(listener, Rc::downgrade(host), actions.clone()));
            }
            Step::Dispatch { target, event } => host.dispatch(&Event::new(event.as_str(), self.target(target)?)),
            Step::Click { element } => host.dispatch(&Event::new("click", EventTarget::Element(self.element(element)?))),
            Step::PushState { url } => host.push_state(url),
            Step::ReplaceState { url } => host.replace_state(url),
            Step::SetLocation { url } => host.set_location(url),
            Step::Visit { element } => {
                let nodes = match element {
                    Some(reference) => vec![self.element(reference)?],
                    None => self.element_order.clone(),
                };
                let tracer = self.agent.tracer();
                for node in nodes {
                    tracer.pre_element_begin(node);
                    tracer.pre_element_finish(node);
                }
            }
            Step::Advance { ms } => host.advance(*ms),
            Step::Unload => host.dispatch(&Event::new("beforeunload", EventTarget::Window)),
        }
        Ok(())
    }

    fn element(&self, reference: &str) -> Result<NodeId> {
        match self.elements.get(reference) {
            Some(node) => Ok(*node),
            None => bail!("Unknown element reference: {:?}", reference),
        }
    }

    fn target(&self, reference: &str) -> Result<EventTarget> {
        Ok(match reference {
            "window" => EventTarget::Window,
            "document" => EventTarget::Document,
            element => EventTarget::Element(self.element(element)?),
        })
    }
}

fn build_host(page: &PageConfig, dom: MemoryDom) -> MemoryHost {
    let host = MemoryHost::with_dom(page.url.as_str(), chrono::Utc::now(), dom);
    for (name, value) in &page.cookies {
        host.set_cookie(name.as_str(), value.as_str());
    }
    host.set_do_not_track(page.dnt.as_deref());
    for capability in &page.missing_capabilities {
        host.remove_capability(*capability);
    }
    host
}

type ElementIndex = HashMap<String, NodeId>;

fn build_dom(elements: &[ElementConfig]) -> Result<(MemoryDom, ElementIndex, Vec<NodeId>)> {
    let mut dom = MemoryDom::new();
    let mut index = HashMap::new();
    let mut order = Vec::new();

    for element in elements {
        if index.contains_key(&element.id) {
            bail!("Duplicate element reference: {:?}", element.id);
        }
        let parent = match &element.parent {
            Some(parent) => match index.get(parent) {
                Some(node) => *node,
                None => bail!("Element {:?} references unknown parent {:?}", element.id, parent),
            },
            None => dom.document(),
        };

        let node = dom.append_element(parent, &element.tag);
        dom.set_attribute(node, "id", &element.id);
        for (name, value) in &element.attributes {
            dom.set_attribute(node, name, value);
        }
        for (name, value) in &element.properties {
            match ElementProperty::from_name(name) {
                Some(property) => dom.set_property(node, property, value),
                None => log::warn!("Ignoring unsupported property {:?} on {:?}", name, element.id),
            }
        }
        if let Some(text) = &element.text {
            dom.append_text(node, text);
        }
        index.insert(element.id.clone(), node);
        order.push(node);
    }

    Ok((dom, index, order))
}

/// A page-script listener performing `actions` when invoked
fn page_listener(name: &str, host: Weak<MemoryHost>, actions: Vec<ListenerAction>) -> Listener {
    Listener::new(name, move |_: &Event| {
        if let Some(host) = host.upgrade() {
            perform(&host, &actions);
        }
    })
}

fn perform(host: &Rc<MemoryHost>, actions: &[ListenerAction]) {
    for action in actions {
        match action {
            ListenerAction::PushState { url } => host.push_state(url),
            ListenerAction::ReplaceState { url } => host.replace_state(url),
            ListenerAction::SetLocation { url } => host.set_location(url),
            ListenerAction::Timeout { ms, actions } => {
                let (weak, actions) = (Rc::downgrade(host), actions.clone());
                host.set_timeout(
                    *ms,
                    Box::new(move || {
                        if let Some(host) = weak.upgrade() {
                            perform(&host, &actions);
                        }
                    }),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rum_trace_core::{Initiator, MemoryTransport, RecordDetails};

    fn scenario(toml_content: &str) -> Scenario {
        toml::from_str(toml_content).unwrap()
    }

    const CHECKOUT: &str = r##"
        [page]
        url = "https://shop.example/cart"

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
        action = "set_location"
        url = "#summary"

        [[steps]]
        action = "visit"

        [[steps]]
        action = "unload"
    "##;

    fn click_settings() -> AgentSettings {
        AgentSettings::default().add_selector(
            rum_trace_core::EventSelectorConfig::new("click", "button").with_attributes("id,innerText"),
        )
    }

    #[test]
    fn test_replay_checkout_session() {
        let scenario = scenario(CHECKOUT);
        let transport = MemoryTransport::new();
        let replay = Replay::new(&scenario, click_settings(), Box::new(transport.clone())).unwrap();

        let summary = replay.run(&scenario.steps).unwrap();
        assert_eq!(summary.steps, 6);
        assert_eq!(summary.state, AgentState::Unloading);
        assert_eq!(summary.open_records, 0);
        assert_eq!(summary.traces, 2);

        let delivered = transport.delivered();
        let listener = &delivered[0];
        assert_eq!(listener.details, RecordDetails::listener("onBuy", "click"));
        assert_eq!(listener.attributes.get("innerText").map(String::as_str), Some("Buy now"));
        let initiators: Vec<_> = listener
            .children
            .iter()
            .map(|c| match &c.details {
                RecordDetails::UrlChange { initiator, .. } => *initiator,
                _ => None,
            })
            .collect();
        assert_eq!(initiators, vec![Some(Initiator::PushState), Some(Initiator::ReplaceState)]);
        assert!(matches!(
            delivered[1].details,
            RecordDetails::UrlChange { initiator: Some(Initiator::HashModified), .. }
        ));
        assert_eq!(replay.host().location(), "https://shop.example/checkout?step=2#summary");
    }

    #[test]
    fn test_unknown_references_fail() {
        let bad_parent = scenario(
            r#"
            [page]
            url = "/"
            [[elements]]
            id = "a"
            tag = "a"
            parent = "missing"
            "#,
        );
        assert!(Replay::new(&bad_parent, AgentSettings::default(), Box::new(MemoryTransport::new())).is_err());

        let bad_step = scenario(
            r#"
            [page]
            url = "/"
            [[steps]]
            action = "click"
            element = "ghost"
            "#,
        );
        let replay = Replay::new(&bad_step, AgentSettings::default(), Box::new(MemoryTransport::new())).unwrap();
        let err = replay.run(&bad_step.steps).unwrap_err();
        assert!(format!("{:#}", err).contains("Unknown element reference"));
    }

    #[test]
    fn test_do_not_track_scenario_sends_nothing() {
        let scenario = scenario(
            r#"
            [page]
            url = "/"
            dnt = "1"
            [[steps]]
            action = "push_state"
            url = "/next"
            [[steps]]
            action = "unload"
            "#,
        );
        let transport = MemoryTransport::new();
        let replay = Replay::new(&scenario, AgentSettings::default(), Box::new(transport.clone())).unwrap();

        let summary = replay.run(&scenario.steps).unwrap();
        assert_eq!(summary.state, AgentState::Disabled);
        assert_eq!(summary.traces, 0);
        assert!(transport.sent().is_empty());
        assert_eq!(replay.host().location(), "/next");
    }

    #[test]
    fn test_invalid_selector_is_reported() {
        let scenario = scenario("[page]\nurl = \"/\"\n");
        let settings =
            AgentSettings::default().add_selector(rum_trace_core::EventSelectorConfig::new("", "button"));
        let err = Replay::new(&scenario, settings, Box::new(MemoryTransport::new())).err().unwrap();
        assert!(err.to_string().contains("Invalid event selector configuration"));
    }
}

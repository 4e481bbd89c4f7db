//! DOM listener attribution
//!
//! Listener executions on elements matched by a configured
//! [`EventSelector`] become `ListenerExecution` records carrying the
//! attributes extracted from the matched elements.

use crate::agent::AgentContext;
use crate::config::AgentSettings;
use crate::dom::NodeId;
use crate::host::{Capability, Event, EventTarget, Host, Listener};
use crate::instrumentation::{ListenerInstrumentation, TraceMode, Tracer};
use crate::plugin::{Plugin, PluginHook};
use crate::selector::EventSelector;
use crate::types::{RecordDetails, Result};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

struct DomListenerInstrumentation {
    selectors: Rc<[EventSelector]>,
    host: Weak<dyn Host>,
}

/// Outcome of matching an event target against every applicable rule
struct SelectorMatch {
    attributes: BTreeMap<String, String>,
    always_relevant: bool,
}

impl DomListenerInstrumentation {
    fn match_target(&self, event_type: &str, node: NodeId) -> Option<SelectorMatch> {
        let host = self.host.upgrade()?;
        let dom = host.dom()?;

        let mut result: Option<SelectorMatch> = None;
        for selector in self.selectors.iter().filter(|s| s.applies_to(event_type)) {
            let Some(element) = selector.matches_element(dom, node) else {
                continue;
            };
            let entry = result.get_or_insert_with(|| SelectorMatch {
                attributes: BTreeMap::new(),
                always_relevant: false,
            });
            selector.extract_attributes(dom, element, &mut entry.attributes);
            entry.always_relevant |= selector.always_relevant();
        }
        result
    }
}

impl ListenerInstrumentation for DomListenerInstrumentation {
    fn should_instrument(&self, _target: &EventTarget, event_type: &str) -> bool {
        self.selectors.iter().any(|s| s.applies_to(event_type))
    }

    fn instrument(&self, tracer: &Tracer, event: &Event, listener: &Listener, execute: &dyn Fn()) {
        let matched = match event.target {
            EventTarget::Element(node) => self.match_target(&event.event_type, node),
            EventTarget::Document | EventTarget::Window => None,
        };
        let Some(matched) = matched else {
            execute();
            return;
        };

        let record = tracer.create_record(RecordDetails::listener(listener.name(), &event.event_type));
        log::trace!(
            "Listener {} for {} matched, {} attribute(s)",
            record,
            event.event_type,
            matched.attributes.len()
        );
        tracer.set_attributes(record, matched.attributes);
        tracer.build_trace(record, TraceMode::Deferred, || {
            if matched.always_relevant {
                tracer.mark_relevant(record);
            }
            execute();
        });
    }
}

/// Built-in plugin attributing listener executions to selector rules
#[derive(Debug, Clone)]
pub struct DomListenerPlugin {
    selectors: Rc<[EventSelector]>,
}

impl DomListenerPlugin {
    pub const NAME: &'static str = "domListener";

    pub fn new(selectors: Vec<EventSelector>) -> Self {
        Self {
            selectors: selectors.into(),
        }
    }

    /// Compile the selector rules of `settings`
    pub fn from_settings(settings: &AgentSettings) -> Result<Self> {
        let selectors = settings
            .selectors
            .iter()
            .map(EventSelector::from_config)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(selectors))
    }

    pub fn selectors(&self) -> &[EventSelector] {
        &self.selectors
    }
}

impl Plugin for DomListenerPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hooks(&self) -> &'static [PluginHook] {
        &[PluginHook::Init]
    }

    fn init(&self, ctx: &AgentContext) {
        let host = ctx.host();
        if !host.supports(Capability::SelectorEngine) || host.dom().is_none() {
            log::info!("No selector engine available, DOM listener attribution disabled");
            return;
        }
        if self.selectors.is_empty() {
            log::debug!("No event selectors configured");
            return;
        }

        ctx.instrumentation()
            .add_listener_instrumentation(Rc::new(DomListenerInstrumentation {
                selectors: Rc::clone(&self.selectors),
                host: Rc::downgrade(host),
            }));
        log::debug!("DOM listener attribution enabled with {} rule(s)", self.selectors.len());
    }
}

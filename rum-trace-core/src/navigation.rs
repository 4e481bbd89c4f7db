//! Single-page-application navigation tracking
//!
//! URL changes that do not reload the page are recorded as `UrlChange`
//! records. Three detection paths share the last known URL:
//!
//! - wrapped `history.pushState` / `history.replaceState`
//! - `popstate` / `hashchange` listeners on the window
//! - a traversal observer noticing a changed location (e.g. an assignment to
//!   `location.hash` that fired no event)

use crate::agent::AgentContext;
use crate::dom::NodeId;
use crate::host::{resolve_url, Event, EventTarget, Host, HostApi, HostFn, HistoryFn, Listener};
use crate::instrumentation::{TraceMode, Tracer};
use crate::observer::TraceObserver;
use crate::plugin::{Plugin, PluginHook};
use crate::types::{Initiator, RecordDetails, RecordId};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Last URL the agent has accounted for
struct UrlTracker {
    last_url: RefCell<String>,
}

impl UrlTracker {
    fn new(url: String) -> Self {
        Self {
            last_url: RefCell::new(url),
        }
    }

    fn last_url(&self) -> String {
        self.last_url.borrow().clone()
    }

    /// Record a change to the current location if it differs from the last one
    fn record_divergence(&self, tracer: &Tracer, host: &dyn Host, initiator: Initiator) -> Option<RecordId> {
        let location = host.location();
        let last = self.last_url();
        if location == last {
            return None;
        }

        let record = tracer.create_record(RecordDetails::url_change(last, location.clone()));
        tracer.build_trace(record, TraceMode::Sync, || {
            *self.last_url.borrow_mut() = location;
            tracer.set_initiator(record, initiator);
            tracer.mark_relevant(record);
        });
        log::debug!("URL change {} detected ({})", record, initiator);
        Some(record)
    }

    /// Wrap a history API so each call produces a `UrlChange` record
    fn wrap_history(
        tracker: &Rc<Self>,
        tracer: &Tracer,
        host: Weak<dyn Host>,
        original: HistoryFn,
        initiator: Initiator,
    ) -> HistoryFn {
        let tracker = Rc::clone(tracker);
        let tracer = tracer.clone();
        Rc::new(move |url: &str| {
            let last = tracker.last_url();
            let record = tracer.create_record(RecordDetails::url_change(last.clone(), resolve_url(&last, url)));
            tracer.build_trace(record, TraceMode::Deferred, || {
                original(url);

                if let Some(host) = host.upgrade() {
                    let location = host.location();
                    tracer.with_record_mut(record, |r| {
                        if let RecordDetails::UrlChange { new_url, .. } = &mut r.details {
                            new_url.clone_from(&location);
                        }
                    });
                    *tracker.last_url.borrow_mut() = location;
                }
                tracer.set_initiator(record, initiator);
                tracer.mark_relevant(record);
            });
        })
    }
}

/// Traversal observer catching silent location changes
struct UrlObserver {
    tracker: Rc<UrlTracker>,
    host: Weak<dyn Host>,
}

impl TraceObserver for UrlObserver {
    fn pre_element_begin(&self, tracer: &Tracer, _element: NodeId) {
        self.check(tracer);
    }

    fn pre_element_finish(&self, tracer: &Tracer, _element: NodeId) {
        self.check(tracer);
    }
}

impl UrlObserver {
    fn check(&self, tracer: &Tracer) {
        if let Some(host) = self.host.upgrade() {
            self.tracker.record_divergence(tracer, &*host, Initiator::HashModified);
        }
    }
}

/// Built-in plugin recording SPA URL changes
#[derive(Debug, Default)]
pub struct SpaNavigationPlugin;

impl SpaNavigationPlugin {
    pub const NAME: &'static str = "spaNavigation";

    pub fn new() -> Self {
        Self
    }
}

impl Plugin for SpaNavigationPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn hooks(&self) -> &'static [PluginHook] {
        &[PluginHook::Init]
    }

    fn init(&self, ctx: &AgentContext) {
        let host = ctx.host();
        let tracer = ctx.tracer();
        let tracker = Rc::new(UrlTracker::new(host.location()));

        if let Some(HostFn::PushState(original)) = host.api(HostApi::PushState) {
            let wrapped = UrlTracker::wrap_history(&tracker, tracer, Rc::downgrade(host), original, Initiator::PushState);
            host.replace_api(HostFn::PushState(wrapped));
        }
        if let Some(HostFn::ReplaceState(original)) = host.api(HostApi::ReplaceState) {
            let wrapped = UrlTracker::wrap_history(&tracker, tracer, Rc::downgrade(host), original, Initiator::ReplaceState);
            host.replace_api(HostFn::ReplaceState(wrapped));
        }

        tracer.run_without(|| {
            for event_type in ["popstate", "hashchange"] {
                let (tracker, tracer, weak_host) = (Rc::clone(&tracker), tracer.clone(), Rc::downgrade(host));
                host.add_event_listener(
                    &EventTarget::Window,
                    event_type,
                    Listener::new("urlChangeListener", move |_: &Event| {
                        if let Some(host) = weak_host.upgrade() {
                            tracker.record_divergence(&tracer, &*host, Initiator::Navigation);
                        }
                    }),
                );
            }
        });

        tracer.add_trace_observer(Rc::new(UrlObserver {
            tracker,
            host: Rc::downgrade(host),
        }));
        log::debug!("SPA navigation tracking installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ManualClock, MemoryHost};
    use crate::transport::MemoryTransport;
    use chrono::Utc;

    fn setup() -> (Rc<MemoryHost>, Tracer, MemoryTransport, Rc<UrlTracker>) {
        let host = Rc::new(MemoryHost::new("https://app.example/home", Utc::now()));
        let transport = MemoryTransport::new();
        let tracer = Tracer::new(Rc::new(ManualClock::new(Utc::now())), Box::new(transport.clone()));
        let tracker = Rc::new(UrlTracker::new(host.location()));
        (host, tracer, transport, tracker)
    }

    #[test]
    fn test_divergence_is_recorded_once() {
        let (host, tracer, transport, tracker) = setup();

        assert!(tracker.record_divergence(&tracer, &*host, Initiator::HashModified).is_none());
        host.set_location("#details");
        assert!(tracker.record_divergence(&tracer, &*host, Initiator::HashModified).is_some());
        assert!(tracker.record_divergence(&tracer, &*host, Initiator::HashModified).is_none());

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].details,
            RecordDetails::UrlChange {
                last_url: "https://app.example/home".to_string(),
                new_url: "https://app.example/home#details".to_string(),
                initiator: Some(Initiator::HashModified),
            }
        );
    }

    #[test]
    fn test_observer_checks_on_both_hooks() {
        let (host, tracer, transport, tracker) = setup();
        let observer = UrlObserver {
            tracker,
            host: Rc::downgrade(&(host.clone() as Rc<dyn Host>)),
        };
        let element = NodeId(1);

        observer.pre_element_begin(&tracer, element);
        host.set_location("#x");
        observer.pre_element_finish(&tracer, element);
        assert_eq!(transport.sent().len(), 1);

        observer.pre_element_begin(&tracer, element);
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn test_wrapped_history_updates_last_url() {
        let (host, tracer, transport, tracker) = setup();
        let weak: Weak<dyn Host> = Rc::downgrade(&(host.clone() as Rc<dyn Host>));
        let Some(HostFn::ReplaceState(original)) = host.api(HostApi::ReplaceState) else {
            panic!("replaceState slot missing");
        };

        let wrapped = UrlTracker::wrap_history(&tracker, &tracer, weak, original, Initiator::ReplaceState);
        wrapped("/settings");

        assert_eq!(host.location(), "https://app.example/settings");
        assert_eq!(tracker.last_url(), "https://app.example/settings");
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0].details,
            RecordDetails::UrlChange { initiator: Some(Initiator::ReplaceState), new_url, .. }
                if new_url == "https://app.example/settings"
        ));
        assert_eq!(sent[0].duration_ms, Some(0));
    }
}

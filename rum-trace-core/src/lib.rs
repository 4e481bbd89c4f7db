//! RUM Trace Core Library
//!
//! The trace-correlation core of a real-user-monitoring agent. It observes page
//! activity (page load, SPA navigation, DOM event listeners, timers) through a
//! [`Host`] abstraction and reconstructs it as trees of causally related trace
//! records, which are handed to a [`Transport`] once relevant and complete.
//!
//! # Architecture
//!
//! - [`record`] holds the record tree, relevance and completion gating
//! - [`context`] is the active-context stack with RAII guards
//! - [`instrumentation`] propagates the context through wrapped host APIs
//! - [`observer`] lets a traversal driver trigger reactive hooks
//! - [`selector`] matches DOM events against configured rules
//! - [`agent`] bootstraps everything and correlates the page load
//!
//! The library does NOT:
//! - Define the backend beacon wire format
//! - Persist anything across page views except the one-shot correlation cookie
//!
//! # Example Usage
//!
//! ```no_run
//! use rum_trace_core::{Agent, AgentSettings, Host, MemoryHost, MemoryTransport};
//! use std::rc::Rc;
//!
//! let host = Rc::new(MemoryHost::new("https://shop.example/", chrono::Utc::now()));
//! let transport = MemoryTransport::new();
//!
//! let agent = Agent::new(host.clone(), AgentSettings::default(), Box::new(transport.clone()));
//! agent.register_default_plugins().unwrap();
//! agent.init();
//!
//! host.push_state("/cart");
//! for trace in transport.sent() {
//!     println!("{}", serde_json::to_string(&trace).unwrap());
//! }
//! ```

// Public modules
pub mod agent;
pub mod config;
pub mod context;
pub mod dom;
pub mod host;
pub mod instrumentation;
pub mod listener;
pub mod navigation;
pub mod observer;
pub mod plugin;
pub mod record;
pub mod selector;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use agent::{Agent, AgentContext, AgentState, DEFAULT_TIMINGS, TRACE_ID_COOKIE_PREFIX};
pub use config::{AgentSettings, EventSelectorConfig};
pub use dom::{DomTree, ElementProperty, MemoryDom, NodeId};
pub use host::{Capability, Clock, Event, EventTarget, Host, Listener, ManualClock, MemoryHost, SystemClock};
pub use instrumentation::{Continuation, Instrumentation, ListenerInstrumentation, TraceMode, Tracer};
pub use listener::DomListenerPlugin;
pub use navigation::SpaNavigationPlugin;
pub use observer::TraceObserver;
pub use plugin::{Plugin, PluginHook};
pub use selector::EventSelector;
pub use transport::{JsonLinesTransport, MemoryTransport, Transport};
pub use types::{FinishedTrace, Initiator, RecordDetails, RecordId, Result, Timestamp, TraceError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_library_basics() {
        // Smoke test: an agent on a fresh host seeds exactly one open record
        let host = Rc::new(MemoryHost::new("/", chrono::Utc::now()));
        let agent = Agent::new(host, AgentSettings::default(), Box::new(MemoryTransport::new()));
        assert_eq!(agent.init(), AgentState::Initializing);
        assert_eq!(agent.tracer().open_records(), 1);
        assert!(!VERSION.is_empty());
    }
}

//! Agent bootstrap and page-load correlation
//!
//! [`Agent::init`] is a one-shot entry point. It checks whether the host can
//! and may be monitored, installs the instrumentation, seeds the page-load root
//! record and drives the plugin lifecycle:
//!
//! ```text
//! Uninitialized -> Initializing -> Ready -> Unloading
//!               \-> Disabled
//! ```
//!
//! Closures the agent leaves in host slots only hold weak references back to
//! the agent, so dropping the [`Agent`] handle releases it.

use crate::config::AgentSettings;
use crate::host::{Capability, Event, EventTarget, Host, Listener};
use crate::instrumentation::{Instrumentation, ListenerInstrumentation, TraceMode, Tracer};
use crate::listener::DomListenerPlugin;
use crate::navigation::SpaNavigationPlugin;
use crate::plugin::{run_hook, Plugin, PluginHook, PluginRegistry};
use crate::transport::Transport;
use crate::types::{RecordDetails, RecordId, Result, TraceError};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

/// Prefix of the one-shot correlation cookie, followed by the backend trace id
pub const TRACE_ID_COOKIE_PREFIX: &str = "inspectIT_traceid_";

/// Completion requirement of the page-load root, cleared on window `load`
pub const DEFAULT_TIMINGS: &str = "defaultTimings";

/// Agent lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Uninitialized,
    Initializing,
    Ready,
    Unloading,
    /// The host failed the capability or do-not-track check
    Disabled,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Uninitialized => "uninitialized",
            AgentState::Initializing => "initializing",
            AgentState::Ready => "ready",
            AgentState::Unloading => "unloading",
            AgentState::Disabled => "disabled",
        };
        write!(f, "{}", name)
    }
}

/// Everything a plugin hook gets to work with
#[derive(Clone)]
pub struct AgentContext {
    tracer: Tracer,
    instrumentation: Instrumentation,
    host: Rc<dyn Host>,
    settings: Rc<AgentSettings>,
}

impl AgentContext {
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }

    pub fn host(&self) -> &Rc<dyn Host> {
        &self.host
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }
}

struct AgentInner {
    ctx: AgentContext,
    plugins: RefCell<PluginRegistry>,
    state: Cell<AgentState>,
    page_load: Cell<Option<RecordId>>,
}

/// The monitoring agent of one page view
#[derive(Clone)]
pub struct Agent {
    inner: Rc<AgentInner>,
}

impl Agent {
    pub fn new(host: Rc<dyn Host>, settings: AgentSettings, transport: Box<dyn Transport>) -> Self {
        let tracer = Tracer::new(host.clock(), transport);
        let instrumentation = Instrumentation::new(tracer.clone());
        Self {
            inner: Rc::new(AgentInner {
                ctx: AgentContext {
                    tracer,
                    instrumentation,
                    host,
                    settings: Rc::new(settings),
                },
                plugins: RefCell::new(PluginRegistry::new()),
                state: Cell::new(AgentState::Uninitialized),
                page_load: Cell::new(None),
            }),
        }
    }

    /// Register a plugin; must happen before [`init`](Self::init)
    pub fn register_plugin(&self, plugin: Rc<dyn Plugin>) -> bool {
        if self.state() != AgentState::Uninitialized {
            log::warn!("Plugin {} registered after init, ignoring", plugin.name());
            return false;
        }
        self.inner.plugins.borrow_mut().register(plugin)
    }

    /// Register the SPA navigation and DOM listener plugins
    ///
    /// Fails if a configured selector rule is invalid, or if either plugin is
    /// refused because it is already registered or the agent was initialized.
    pub fn register_default_plugins(&self) -> Result<()> {
        let dom_listener = DomListenerPlugin::from_settings(self.settings())?;
        let defaults: [Rc<dyn Plugin>; 2] = [Rc::new(SpaNavigationPlugin::new()), Rc::new(dom_listener)];
        for plugin in defaults {
            if !self.register_plugin(Rc::clone(&plugin)) {
                return Err(TraceError::PluginRejected(plugin.name().to_string()));
            }
        }
        Ok(())
    }

    pub fn state(&self) -> AgentState {
        self.inner.state.get()
    }

    pub fn context(&self) -> &AgentContext {
        &self.inner.ctx
    }

    pub fn tracer(&self) -> &Tracer {
        &self.inner.ctx.tracer
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.inner.ctx.settings
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.inner.plugins.borrow().names()
    }

    /// The page-load root record, once seeded
    pub fn page_load_record(&self) -> Option<RecordId> {
        self.inner.page_load.get()
    }

    /// Boot the agent; calls after the first one are ignored
    pub fn init(&self) -> AgentState {
        if self.state() != AgentState::Uninitialized {
            log::debug!("init called again in state {}, ignoring", self.state());
            return self.state();
        }
        self.inner.state.set(AgentState::Initializing);

        if let Some(reason) = self.refusal() {
            log::info!("Agent disabled: {}", reason);
            self.inner.state.set(AgentState::Disabled);
            return AgentState::Disabled;
        }

        let ctx = &self.inner.ctx;
        ctx.instrumentation.install(&*ctx.host);
        ctx.tracer.init_transport();
        self.init_page_load_elements();

        let plugins = self.inner.plugins.borrow().with_hook(PluginHook::Init);
        run_hook(&plugins, PluginHook::Init, ctx);

        let weak = Rc::downgrade(&self.inner);
        ctx.tracer.run_without(|| {
            let for_async = Weak::clone(&weak);
            ctx.host.set_timeout(
                ctx.settings.async_init_delay_ms,
                Box::new(move || {
                    if let Some(inner) = for_async.upgrade() {
                        Agent { inner }.async_init();
                    }
                }),
            );

            ctx.host.add_event_listener(
                &EventTarget::Window,
                "beforeunload",
                Listener::new("beforeUnload", move |_: &Event| {
                    if let Some(inner) = weak.upgrade() {
                        Agent { inner }.before_unload();
                    }
                }),
            );
        });

        log::info!(
            "Agent initialized with {} plugin(s) at {}",
            self.inner.plugins.borrow().len(),
            ctx.host.location()
        );
        self.state()
    }

    /// Why the host must not be monitored, if it must not
    fn refusal(&self) -> Option<String> {
        let host = &self.inner.ctx.host;
        for capability in [Capability::EventListeners, Capability::XmlHttpRequest] {
            if !host.supports(capability) {
                return Some(format!("missing capability {:?}", capability));
            }
        }
        if self.settings().respect_dnt {
            if let Some(value) = host.do_not_track() {
                if AgentSettings::is_opt_out_signal(&value) {
                    return Some(format!("do-not-track is {:?}", value));
                }
            }
        }
        None
    }

    fn async_init(&self) {
        if self.state() != AgentState::Initializing {
            log::debug!("Skipping async init in state {}", self.state());
            return;
        }
        let plugins = self.inner.plugins.borrow().with_hook(PluginHook::AsyncInit);
        run_hook(&plugins, PluginHook::AsyncInit, &self.inner.ctx);
        self.inner.state.set(AgentState::Ready);
        log::info!("Agent ready");
    }

    fn before_unload(&self) {
        if self.state() == AgentState::Unloading {
            return;
        }
        self.inner.state.set(AgentState::Unloading);
        let plugins = self.inner.plugins.borrow().with_hook(PluginHook::BeforeUnload);
        run_hook(&plugins, PluginHook::BeforeUnload, &self.inner.ctx);
        self.inner.ctx.tracer.finish();
        log::info!("Agent unloaded");
    }

    /// Seed the page-load root record
    fn init_page_load_elements(&self) {
        let ctx = &self.inner.ctx;
        let tracer = &ctx.tracer;
        let backend_trace_id = resolve_backend_trace_id(&*ctx.host, ctx.settings.trace_id.as_deref());

        let root = tracer.create_record_with_parent(
            RecordDetails::page_load(Some(ctx.host.location()), backend_trace_id),
            None,
        );
        if let Err(e) = tracer.require(root, DEFAULT_TIMINGS) {
            log::warn!("Failed to seed page-load record: {}", e);
        }
        tracer.enter(root, ctx.host.now());
        self.inner.page_load.set(Some(root));

        // Completion waits one tick so load listeners registered after the
        // agent still attach to the root.
        let weak_host = Rc::downgrade(&ctx.host);
        let on_load = tracer.clone();
        tracer.run_without(|| {
            ctx.host.add_event_listener(
                &EventTarget::Window,
                "load",
                Listener::new("pageLoadComplete", move |_: &Event| {
                    on_load.finish_duration(root);
                    let Some(host) = weak_host.upgrade() else {
                        return;
                    };
                    let complete = on_load.clone();
                    on_load.run_without(|| {
                        host.set_timeout(0, Box::new(move || complete.mark_complete(root, DEFAULT_TIMINGS)));
                    });
                }),
            );
        });

        tracer.mark_relevant(root);
        ctx.instrumentation
            .add_listener_instrumentation(Rc::new(PageLoadListeners { root }));
        log::debug!("Seeded page-load record {}", root);
    }
}

/// Backend trace id to correlate with, consuming its one-shot cookie
///
/// Without the cookie the page came from the cache and the id is dropped.
pub fn resolve_backend_trace_id(host: &dyn Host, trace_id: Option<&str>) -> Option<String> {
    let trace_id = trace_id.filter(|id| !id.is_empty())?;
    let cookie = format!("{}{}", TRACE_ID_COOKIE_PREFIX, trace_id);
    if host.cookie(&cookie).is_some() {
        host.delete_cookie(&cookie);
        Some(trace_id.to_string())
    } else {
        log::debug!("Correlation cookie {} absent, page served from cache", cookie);
        None
    }
}

/// Records `load`/`DOMContentLoaded` listeners under the page-load root
struct PageLoadListeners {
    root: RecordId,
}

impl ListenerInstrumentation for PageLoadListeners {
    fn should_instrument(&self, target: &EventTarget, event_type: &str) -> bool {
        match target {
            EventTarget::Document => event_type == "load" || event_type == "DOMContentLoaded",
            EventTarget::Window => event_type == "load",
            EventTarget::Element(_) => false,
        }
    }

    fn instrument(&self, tracer: &Tracer, event: &Event, listener: &Listener, execute: &dyn Fn()) {
        let record = tracer.create_record_with_parent(
            RecordDetails::listener(listener.name(), &event.event_type),
            Some(self.root),
        );
        tracer.build_trace(record, TraceMode::Deferred, execute);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use crate::transport::MemoryTransport;
    use chrono::{TimeZone, Utc};

    fn host() -> Rc<MemoryHost> {
        Rc::new(MemoryHost::new(
            "https://shop.example/cart",
            Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        ))
    }

    #[test]
    fn test_resolve_backend_trace_id() {
        let host = host();
        host.set_cookie("inspectIT_traceid_abc123", "1");

        assert_eq!(resolve_backend_trace_id(&*host, Some("abc123")), Some("abc123".to_string()));
        assert!(!host.has_cookie("inspectIT_traceid_abc123"));
        assert_eq!(resolve_backend_trace_id(&*host, Some("abc123")), None);
        assert_eq!(resolve_backend_trace_id(&*host, None), None);
    }

    #[test]
    fn test_init_is_one_shot() {
        let host = host();
        let agent = Agent::new(host.clone(), AgentSettings::default(), Box::new(MemoryTransport::new()));

        assert_eq!(agent.init(), AgentState::Initializing);
        let root = agent.page_load_record();
        assert_eq!(agent.init(), AgentState::Initializing);
        assert_eq!(agent.page_load_record(), root);
        assert_eq!(host.listener_count(EventTarget::Window, "beforeunload"), 1);
    }

    #[test]
    fn test_plugins_after_init_are_ignored() {
        let agent = Agent::new(host(), AgentSettings::default(), Box::new(MemoryTransport::new()));
        agent.init();
        assert!(!agent.register_plugin(Rc::new(SpaNavigationPlugin::new())));
        assert!(agent.plugin_names().is_empty());
    }

    #[test]
    fn test_default_plugins_register_once() {
        let agent = Agent::new(host(), AgentSettings::default(), Box::new(MemoryTransport::new()));
        agent.register_default_plugins().unwrap();
        assert_eq!(agent.plugin_names().len(), 2);

        let again = agent.register_default_plugins();
        assert!(matches!(again, Err(TraceError::PluginRejected(name)) if name == SpaNavigationPlugin::NAME));

        let late = Agent::new(host(), AgentSettings::default(), Box::new(MemoryTransport::new()));
        late.init();
        assert!(matches!(late.register_default_plugins(), Err(TraceError::PluginRejected(_))));
    }

    #[test]
    fn test_huge_async_init_delay_never_fires() {
        let host = host();
        let settings = AgentSettings::default().with_async_init_delay(u64::MAX / 4);
        let agent = Agent::new(host.clone(), settings, Box::new(MemoryTransport::new()));

        assert_eq!(agent.init(), AgentState::Initializing);
        host.advance(1_000);
        assert_eq!(agent.state(), AgentState::Initializing);
    }

    #[test]
    fn test_page_load_listener_instrumentation_targets() {
        let hook = PageLoadListeners { root: RecordId(1) };
        assert!(hook.should_instrument(&EventTarget::Document, "DOMContentLoaded"));
        assert!(hook.should_instrument(&EventTarget::Document, "load"));
        assert!(hook.should_instrument(&EventTarget::Window, "load"));
        assert!(!hook.should_instrument(&EventTarget::Window, "DOMContentLoaded"));
        assert!(!hook.should_instrument(&EventTarget::Element(crate::dom::NodeId(2)), "load"));
    }
}

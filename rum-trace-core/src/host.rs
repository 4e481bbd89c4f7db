//! Host capabilities
//!
//! The agent never talks to a browser directly. Everything it needs from the
//! page is expressed by the [`Host`] trait. Host APIs that the agent wraps are
//! *slots*: [`Host::api`] returns the current implementation and
//! [`Host::replace_api`] installs a substitute. A missing slot means the page
//! does not support that API.
//!
//! [`MemoryHost`] is a complete in-memory host with a manual clock, a timer
//! queue, listener dispatch with bubbling and an in-memory DOM.

use crate::dom::{DomTree, MemoryDom, NodeId};
use crate::types::{Duration, Timestamp};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

/// Source of the current time
pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self { now: Cell::new(start) }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.set(now);
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.get()
    }
}

/// Optional host features checked by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    EventListeners,
    XmlHttpRequest,
    History,
    SelectorEngine,
}

/// Host APIs the agent may substitute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostApi {
    AddEventListener,
    SetTimeout,
    PushState,
    ReplaceState,
}

/// Target of a DOM event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTarget {
    Window,
    Document,
    Element(NodeId),
}

/// A dispatched DOM event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: String,
    pub target: EventTarget,
}

impl Event {
    pub fn new(event_type: impl Into<String>, target: EventTarget) -> Self {
        Self {
            event_type: event_type.into(),
            target,
        }
    }
}

pub type ListenerFn = Rc<dyn Fn(&Event)>;

/// An event listener callback with the function name reported in traces
#[derive(Clone)]
pub struct Listener {
    name: String,
    callback: ListenerFn,
}

impl Listener {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Event) + 'static,
    {
        Self {
            name: name.into(),
            callback: Rc::new(callback),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, event: &Event) {
        (self.callback)(event)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("name", &self.name).finish()
    }
}

/// A deferred unit of work handed to the host
pub type Task = Box<dyn FnOnce()>;

pub type AddEventListenerFn = Rc<dyn Fn(&EventTarget, &str, Listener)>;
pub type SetTimeoutFn = Rc<dyn Fn(u64, Task)>;
pub type HistoryFn = Rc<dyn Fn(&str)>;

/// Implementation of one host API slot
#[derive(Clone)]
pub enum HostFn {
    AddEventListener(AddEventListenerFn),
    SetTimeout(SetTimeoutFn),
    PushState(HistoryFn),
    ReplaceState(HistoryFn),
}

impl HostFn {
    /// The slot this implementation belongs in
    pub fn api(&self) -> HostApi {
        match self {
            HostFn::AddEventListener(_) => HostApi::AddEventListener,
            HostFn::SetTimeout(_) => HostApi::SetTimeout,
            HostFn::PushState(_) => HostApi::PushState,
            HostFn::ReplaceState(_) => HostApi::ReplaceState,
        }
    }
}

impl fmt::Debug for HostFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFn::{:?}", self.api())
    }
}

/// Everything the agent needs from the page
pub trait Host {
    /// Clock shared with the tracer
    fn clock(&self) -> Rc<dyn Clock>;

    /// Current `location.href`
    fn location(&self) -> String;

    fn supports(&self, capability: Capability) -> bool;

    /// Raw do-not-track signal, if the page exposes one
    fn do_not_track(&self) -> Option<String>;

    fn cookie(&self, name: &str) -> Option<String>;

    fn delete_cookie(&self, name: &str);

    /// Current implementation of a host API, `None` if unsupported
    fn api(&self, api: HostApi) -> Option<HostFn>;

    /// Install a substitute implementation
    fn replace_api(&self, implementation: HostFn);

    /// The document tree, if the host exposes one
    fn dom(&self) -> Option<&dyn DomTree>;

    fn now(&self) -> Timestamp {
        self.clock().now()
    }

    fn add_event_listener(&self, target: &EventTarget, event_type: &str, listener: Listener) {
        match self.api(HostApi::AddEventListener) {
            Some(HostFn::AddEventListener(f)) => f(target, event_type, listener),
            _ => log::debug!("addEventListener unavailable, dropping listener for {}", event_type),
        }
    }

    fn set_timeout(&self, delay_ms: u64, task: Task) {
        match self.api(HostApi::SetTimeout) {
            Some(HostFn::SetTimeout(f)) => f(delay_ms, task),
            _ => log::debug!("setTimeout unavailable, dropping task"),
        }
    }

    fn push_state(&self, url: &str) {
        if let Some(HostFn::PushState(f)) = self.api(HostApi::PushState) {
            f(url);
        }
    }

    fn replace_state(&self, url: &str) {
        if let Some(HostFn::ReplaceState(f)) = self.api(HostApi::ReplaceState) {
            f(url);
        }
    }
}

/// Resolve `url` against `base` the way `history.pushState` does for the
/// URL shapes used by single-page applications
pub fn resolve_url(base: &str, url: &str) -> String {
    if url.contains("://") {
        return url.to_string();
    }
    let without_fragment = base.split('#').next().unwrap_or(base);
    if url.starts_with('#') {
        return format!("{}{}", without_fragment, url);
    }
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    if url.starts_with('?') {
        return format!("{}{}", without_query, url);
    }
    let origin_end = match without_query.find("://") {
        Some(scheme_end) => without_query[scheme_end + 3..]
            .find('/')
            .map(|p| scheme_end + 3 + p)
            .unwrap_or(without_query.len()),
        None => 0,
    };
    if url.starts_with('/') {
        return format!("{}{}", &without_query[..origin_end], url);
    }
    let dir_end = without_query.rfind('/').map(|p| p + 1).unwrap_or(origin_end);
    format!("{}{}", &without_query[..dir_end.max(origin_end)], url)
}

struct RegisteredListener {
    target: EventTarget,
    event_type: String,
    listener: Listener,
}

struct PendingTimer {
    due: Timestamp,
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct TimerQueue {
    timers: Vec<PendingTimer>,
    next_seq: u64,
}

impl TimerQueue {
    fn schedule(&mut self, due: Timestamp, task: Task) {
        self.next_seq += 1;
        self.timers.push(PendingTimer { due, seq: self.next_seq, task });
    }

    fn pop_due(&mut self, until: Timestamp) -> Option<PendingTimer> {
        let idx = self
            .timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.due <= until)
            .min_by_key(|(_, t)| (t.due, t.seq))
            .map(|(i, _)| i)?;
        Some(self.timers.remove(idx))
    }
}

/// `now` plus `ms`, if representable
fn deadline(now: Timestamp, ms: u64) -> Option<Timestamp> {
    let delay = i64::try_from(ms).ok().and_then(Duration::try_milliseconds)?;
    now.checked_add_signed(delay)
}

/// In-memory host
pub struct MemoryHost {
    clock: Rc<ManualClock>,
    location: Rc<RefCell<String>>,
    cookies: RefCell<BTreeMap<String, String>>,
    do_not_track: RefCell<Option<String>>,
    missing: RefCell<HashSet<Capability>>,
    slots: RefCell<HashMap<HostApi, HostFn>>,
    listeners: Rc<RefCell<Vec<RegisteredListener>>>,
    timers: Rc<RefCell<TimerQueue>>,
    dom: MemoryDom,
}

impl MemoryHost {
    /// Create a host showing `url`, with an empty document and every capability
    pub fn new(url: impl Into<String>, start: Timestamp) -> Self {
        Self::with_dom(url, start, MemoryDom::new())
    }

    /// Create a host with a prepared document
    pub fn with_dom(url: impl Into<String>, start: Timestamp, dom: MemoryDom) -> Self {
        let host = Self {
            clock: Rc::new(ManualClock::new(start)),
            location: Rc::new(RefCell::new(url.into())),
            cookies: RefCell::new(BTreeMap::new()),
            do_not_track: RefCell::new(None),
            missing: RefCell::new(HashSet::new()),
            slots: RefCell::new(HashMap::new()),
            listeners: Rc::new(RefCell::new(Vec::new())),
            timers: Rc::new(RefCell::new(TimerQueue::default())),
            dom,
        };
        host.install_native_apis();
        host
    }

    fn install_native_apis(&self) {
        let listeners = Rc::clone(&self.listeners);
        self.replace_api(HostFn::AddEventListener(Rc::new(
            move |target: &EventTarget, event_type: &str, listener: Listener| {
                listeners.borrow_mut().push(RegisteredListener {
                    target: *target,
                    event_type: event_type.to_string(),
                    listener,
                });
            },
        )));

        let timers = Rc::clone(&self.timers);
        let clock = Rc::clone(&self.clock);
        self.replace_api(HostFn::SetTimeout(Rc::new(move |delay_ms: u64, task: Task| {
            match deadline(clock.now(), delay_ms) {
                Some(due) => timers.borrow_mut().schedule(due, task),
                None => log::warn!("Dropping timer with out-of-range delay of {} ms", delay_ms),
            }
        })));

        let location = Rc::clone(&self.location);
        self.replace_api(HostFn::PushState(Rc::new(move |url: &str| {
            let resolved = resolve_url(&location.borrow(), url);
            *location.borrow_mut() = resolved;
        })));

        let location = Rc::clone(&self.location);
        self.replace_api(HostFn::ReplaceState(Rc::new(move |url: &str| {
            let resolved = resolve_url(&location.borrow(), url);
            *location.borrow_mut() = resolved;
        })));
    }

    /// Change the location without any event (e.g. `location.hash = ...`)
    pub fn set_location(&self, url: &str) {
        let resolved = resolve_url(&self.location.borrow(), url);
        *self.location.borrow_mut() = resolved;
    }

    pub fn set_cookie(&self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.borrow_mut().insert(name.into(), value.into());
    }

    pub fn set_do_not_track(&self, value: Option<&str>) {
        *self.do_not_track.borrow_mut() = value.map(str::to_string);
    }

    /// Remove a capability and the host APIs that depend on it
    pub fn remove_capability(&self, capability: Capability) {
        self.missing.borrow_mut().insert(capability);
        match capability {
            Capability::EventListeners => self.remove_api(HostApi::AddEventListener),
            Capability::History => {
                self.remove_api(HostApi::PushState);
                self.remove_api(HostApi::ReplaceState);
            }
            Capability::XmlHttpRequest | Capability::SelectorEngine => {}
        }
    }

    pub fn remove_api(&self, api: HostApi) {
        self.slots.borrow_mut().remove(&api);
    }

    /// Dispatch an event: target listeners first, then document, then window
    pub fn dispatch(&self, event: &Event) {
        let path: Vec<EventTarget> = match event.target {
            EventTarget::Element(_) => vec![event.target, EventTarget::Document, EventTarget::Window],
            EventTarget::Document => vec![EventTarget::Document, EventTarget::Window],
            EventTarget::Window => vec![EventTarget::Window],
        };

        for target in path {
            let matching: Vec<Listener> = self
                .listeners
                .borrow()
                .iter()
                .filter(|l| l.target == target && l.event_type == event.event_type)
                .map(|l| l.listener.clone())
                .collect();
            log::trace!("Dispatching {} to {} listener(s) on {:?}", event.event_type, matching.len(), target);
            for listener in matching {
                listener.call(event);
            }
        }
    }

    /// Advance the clock, running every timer that becomes due in order
    pub fn advance(&self, ms: u64) {
        let until = deadline(self.clock.now(), ms).unwrap_or_else(|| {
            log::warn!("Advancing by {} ms leaves the clock range, stopping at its end", ms);
            Timestamp::MAX_UTC
        });
        loop {
            let next = self.timers.borrow_mut().pop_due(until);
            match next {
                Some(timer) => {
                    if timer.due > self.clock.now() {
                        self.clock.set(timer.due);
                    }
                    (timer.task)();
                }
                None => break,
            }
        }
        self.clock.set(until);
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.borrow().timers.len()
    }

    pub fn listener_count(&self, target: EventTarget, event_type: &str) -> usize {
        self.listeners
            .borrow()
            .iter()
            .filter(|l| l.target == target && l.event_type == event_type)
            .count()
    }

    pub fn has_cookie(&self, name: &str) -> bool {
        self.cookies.borrow().contains_key(name)
    }
}

impl Host for MemoryHost {
    fn clock(&self) -> Rc<dyn Clock> {
        self.clock.clone()
    }

    fn location(&self) -> String {
        self.location.borrow().clone()
    }

    fn supports(&self, capability: Capability) -> bool {
        !self.missing.borrow().contains(&capability)
    }

    fn do_not_track(&self) -> Option<String> {
        self.do_not_track.borrow().clone()
    }

    fn cookie(&self, name: &str) -> Option<String> {
        self.cookies.borrow().get(name).cloned()
    }

    fn delete_cookie(&self, name: &str) {
        self.cookies.borrow_mut().remove(name);
    }

    fn api(&self, api: HostApi) -> Option<HostFn> {
        self.slots.borrow().get(&api).cloned()
    }

    fn replace_api(&self, implementation: HostFn) {
        self.slots.borrow_mut().insert(implementation.api(), implementation);
    }

    fn dom(&self) -> Option<&dyn DomTree> {
        Some(&self.dom)
    }
}

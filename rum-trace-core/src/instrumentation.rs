//! Context propagation and host-API instrumentation
//!
//! [`Tracer`] is the handle every instrumented call threads through. It owns
//! the record store, the active-context stack, the registered traversal
//! observers and the transport, and implements the correlation primitives:
//!
//! - [`Tracer::build_trace`] runs a body with a record active, so records
//!   created inside attach under it.
//! - [`Tracer::run_without`] runs a body with attribution suspended.
//! - [`Tracer::capture`] turns a callback into a [`Continuation`] that carries
//!   the frame active at capture time into a later tick.
//!
//! [`Instrumentation`] substitutes the host's listener registration and timer
//! APIs so callbacks registered under a record run under that record again.

use crate::context::{ActiveContext, ContextEntry, ContextGuard, Frame};
use crate::dom::NodeId;
use crate::host::{Clock, Event, EventTarget, Host, HostApi, HostFn, Listener, Task};
use crate::observer::{ObserverRegistry, TraceObserver};
use crate::record::{TraceRecord, TraceStore};
use crate::transport::Transport;
use crate::types::{Duration, Initiator, RecordDetails, RecordId, Result, Timestamp};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

/// How a record propagates to work scheduled from its span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    /// Observed within one synchronous turn; duration ends with the body
    Sync,
    /// Continuations captured during the body keep the record open until they
    /// ran; duration ends with the last of them
    Deferred,
}

struct TracerInner {
    store: RefCell<TraceStore>,
    context: ActiveContext,
    clock: Rc<dyn Clock>,
    transport: RefCell<Box<dyn Transport>>,
    observers: RefCell<ObserverRegistry>,
    flushed: Cell<usize>,
}

/// Shared handle to the trace-correlation state of one page
#[derive(Clone)]
pub struct Tracer {
    inner: Rc<TracerInner>,
}

impl Tracer {
    pub fn new(clock: Rc<dyn Clock>, transport: Box<dyn Transport>) -> Self {
        Self {
            inner: Rc::new(TracerInner {
                store: RefCell::new(TraceStore::new()),
                context: ActiveContext::new(),
                clock,
                transport: RefCell::new(transport),
                observers: RefCell::new(ObserverRegistry::new()),
                flushed: Cell::new(0),
            }),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    pub fn context(&self) -> &ActiveContext {
        &self.inner.context
    }

    /// The active record, if any
    pub fn current(&self) -> Option<RecordId> {
        self.inner.context.current()
    }

    /// Create a record under the active record
    pub fn create_record(&self, details: RecordDetails) -> RecordId {
        let parent = self.current();
        self.create_record_with_parent(details, parent)
    }

    /// Create a record under an explicit parent (or as a root)
    pub fn create_record_with_parent(&self, details: RecordDetails, parent: Option<RecordId>) -> RecordId {
        self.inner.store.borrow_mut().create(details, parent)
    }

    pub fn set_parent(&self, child: RecordId, parent: RecordId) {
        self.inner.store.borrow_mut().set_parent(child, parent);
    }

    pub fn attach_child(&self, parent: RecordId, child: RecordId) {
        self.set_parent(child, parent);
    }

    /// Add a completion requirement; fails once the record is closed
    pub fn require(&self, id: RecordId, name: &str) -> Result<()> {
        self.inner.store.borrow_mut().require(id, name)
    }

    /// Clear a completion requirement and flush the tree if it is now done
    pub fn mark_complete(&self, id: RecordId, name: &str) {
        let cleared = self.inner.store.borrow_mut().mark_complete(id, name);
        if cleared {
            log::debug!("Requirement {} of {} satisfied", name, id);
            self.settle(id);
        }
    }

    /// Mark a record and its ancestors relevant
    pub fn mark_relevant(&self, id: RecordId) {
        self.inner.store.borrow_mut().mark_relevant(id);
        self.settle(id);
    }

    /// Drop a subtree without reporting it
    pub fn discard(&self, id: RecordId) {
        let parent = self.inner.store.borrow().get(id).and_then(|r| r.parent);
        self.inner.store.borrow_mut().discard(id);
        if let Some(parent) = parent {
            self.settle(parent);
        }
    }

    pub fn is_relevant(&self, id: RecordId) -> bool {
        self.inner.store.borrow().is_relevant(id)
    }

    pub fn is_flush_eligible(&self, id: RecordId) -> bool {
        self.inner.store.borrow().is_flush_eligible(id)
    }

    /// True while the record has not been flushed or discarded
    pub fn is_open(&self, id: RecordId) -> bool {
        self.inner.store.borrow().contains(id)
    }

    /// Snapshot of a record
    pub fn record(&self, id: RecordId) -> Option<TraceRecord> {
        self.inner.store.borrow().get(id).cloned()
    }

    /// Number of records not yet flushed or discarded
    pub fn open_records(&self) -> usize {
        self.inner.store.borrow().len()
    }

    /// Number of trees handed to the transport
    pub fn flushed_traces(&self) -> usize {
        self.inner.flushed.get()
    }

    /// Run `f` on a stored record; `None` if it is closed
    pub fn with_record_mut<R>(&self, id: RecordId, f: impl FnOnce(&mut TraceRecord) -> R) -> Option<R> {
        self.inner.store.borrow_mut().get_mut(id).map(f)
    }

    pub fn set_initiator(&self, id: RecordId, initiator: Initiator) {
        self.with_record_mut(id, |record| {
            if let RecordDetails::UrlChange { initiator: slot, .. } = &mut record.details {
                *slot = Some(initiator);
            }
        });
    }

    pub fn set_attributes(&self, id: RecordId, attributes: BTreeMap<String, String>) {
        self.with_record_mut(id, |record| {
            for (key, value) in attributes {
                record.attributes.entry(key).or_insert(value);
            }
        });
    }

    pub fn enter(&self, id: RecordId, at: Timestamp) {
        self.inner.store.borrow_mut().enter(id, at);
    }

    pub fn set_duration(&self, id: RecordId, duration: Duration) {
        self.inner.store.borrow_mut().set_duration(id, duration);
    }

    /// Finalise the duration as now minus the enter timestamp unless already set
    pub fn finish_duration(&self, id: RecordId) {
        let now = self.now();
        self.inner.store.borrow_mut().finish_duration(id, now);
    }

    /// Run `body` with `id` active
    ///
    /// Records created by `body`, including from re-entrant calls into other
    /// wrapped host APIs, attach under `id`. The frame is popped on every exit
    /// path.
    pub fn build_trace<R>(&self, id: RecordId, mode: TraceMode, body: impl FnOnce() -> R) -> R {
        let now = self.now();
        {
            let mut store = self.inner.store.borrow_mut();
            store.enter(id, now);
            if let Some(record) = store.get_mut(id) {
                record.active_spans += 1;
            }
        }
        let guard = match mode {
            TraceMode::Sync => self.inner.context.enter(Frame::Record(id)),
            TraceMode::Deferred => self.inner.context.enter_deferred(id),
        };
        let _span = SpanGuard {
            tracer: self,
            id,
            mode,
            context: Some(guard),
        };
        body()
    }

    /// [`build_trace`](Self::build_trace) without a body
    pub fn build_trace_empty(&self, id: RecordId, mode: TraceMode) {
        self.build_trace(id, mode, || ())
    }

    /// Run `body` with attribution suspended
    pub fn run_without<R>(&self, body: impl FnOnce() -> R) -> R {
        let _guard = self.inner.context.enter(Frame::Suspended);
        body()
    }

    /// Run `body` inside a previously captured entry
    pub fn with_entry<R>(&self, entry: Option<ContextEntry>, body: impl FnOnce() -> R) -> R {
        let _guard = entry.map(|e| self.inner.context.enter_entry(e));
        body()
    }

    /// Capture `task` together with the active frame
    ///
    /// The record stays attachable until the continuation has run or been
    /// dropped. Inside a deferred span it also stays open for that long.
    pub fn capture(&self, task: impl FnOnce() + 'static) -> Continuation {
        let entry = self.inner.context.current_entry();
        let (attached, holds) = match entry {
            Some(ContextEntry { frame: Frame::Record(id), deferred }) => {
                let mut store = self.inner.store.borrow_mut();
                let attached = store.hold(id).then_some(id);
                let holds = match store.get_mut(id) {
                    Some(record) if deferred => {
                        record.pending_continuations += 1;
                        Some(id)
                    }
                    _ => None,
                };
                (attached, holds)
            }
            _ => (None, None),
        };
        Continuation {
            tracer: self.clone(),
            entry,
            attached,
            holds,
            task: Some(Box::new(task)),
        }
    }

    /// Keep `id` attachable while a listener bound to it is registered
    fn hold(&self, id: RecordId) -> Option<AttachHold> {
        let held = self.inner.store.borrow_mut().hold(id);
        held.then(|| AttachHold {
            tracer: self.clone(),
            id,
        })
    }

    fn release_hold(&self, id: RecordId) {
        self.inner.store.borrow_mut().release(id);
        self.settle(id);
    }

    fn release_continuation(&self, id: RecordId) {
        let now = self.now();
        {
            let mut store = self.inner.store.borrow_mut();
            let Some(record) = store.get_mut(id) else {
                return;
            };
            record.pending_continuations = record.pending_continuations.saturating_sub(1);
            store.finish_if_idle(id, now);
        }
        self.settle(id);
    }

    fn end_span(&self, id: RecordId, mode: TraceMode) {
        let now = self.now();
        {
            let mut store = self.inner.store.borrow_mut();
            if let Some(record) = store.get_mut(id) {
                record.active_spans = record.active_spans.saturating_sub(1);
            }
            match mode {
                TraceMode::Sync => store.finish_duration(id, now),
                TraceMode::Deferred => store.finish_if_idle(id, now),
            }
        }
        self.settle(id);
    }

    /// Hand the tree of `id` to the transport if it is relevant and complete,
    /// or release it if it is complete and nothing can make it relevant
    fn settle(&self, id: RecordId) {
        let trace = {
            let mut store = self.inner.store.borrow_mut();
            if let Some(root) = store.releasable_root(id) {
                store.discard(root);
                log::trace!("Released irrelevant trace {}", root);
                return;
            }
            match store.ready_root(id) {
                Some(root) => store.take_trace(root),
                None => None,
            }
        };
        if let Some(trace) = trace {
            log::debug!("Flushing trace {} with {} record(s)", trace.id, trace.record_count());
            self.inner.flushed.set(self.inner.flushed.get() + 1);
            self.inner.transport.borrow_mut().send(trace);
        }
    }

    /// Initialise the transport
    pub fn init_transport(&self) {
        self.inner.transport.borrow_mut().init();
    }

    /// Abandon every unfinished tree and flush the transport
    pub fn finish(&self) {
        let roots = self.inner.store.borrow().roots();
        for root in &roots {
            self.settle(*root);
        }
        let abandoned = {
            let mut store = self.inner.store.borrow_mut();
            let remaining = store.roots();
            for root in &remaining {
                store.discard(*root);
            }
            remaining.len()
        };
        if abandoned > 0 {
            log::info!("Abandoned {} unfinished trace(s) at unload", abandoned);
        }
        self.inner.transport.borrow_mut().flush_all();
    }

    pub fn add_trace_observer(&self, observer: Rc<dyn TraceObserver>) {
        self.inner.observers.borrow_mut().add(observer);
    }

    /// Called by the traversal driver before an element is processed
    pub fn pre_element_begin(&self, element: NodeId) {
        let observers = self.inner.observers.borrow().clone();
        for observer in observers.iter() {
            observer.pre_element_begin(self, element);
        }
    }

    /// Called by the traversal driver after an element was processed
    pub fn pre_element_finish(&self, element: NodeId) {
        let observers = self.inner.observers.borrow().clone();
        for observer in observers.iter() {
            observer.pre_element_finish(self, element);
        }
    }
}

/// Ends a `build_trace` span on drop
struct SpanGuard<'a> {
    tracer: &'a Tracer,
    id: RecordId,
    mode: TraceMode,
    context: Option<ContextGuard>,
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        drop(self.context.take());
        self.tracer.end_span(self.id, self.mode);
    }
}

/// Keeps a record attachable until dropped
struct AttachHold {
    tracer: Tracer,
    id: RecordId,
}

impl Drop for AttachHold {
    fn drop(&mut self) {
        self.tracer.release_hold(self.id);
    }
}

/// A callback bound to the frame that was active when it was captured
pub struct Continuation {
    tracer: Tracer,
    entry: Option<ContextEntry>,
    attached: Option<RecordId>,
    holds: Option<RecordId>,
    task: Option<Task>,
}

impl Continuation {
    /// The record this continuation attaches to
    pub fn parent(&self) -> Option<RecordId> {
        self.entry.and_then(|e| e.record())
    }

    /// Run the task inside the captured frame
    pub fn run(mut self) {
        if let Some(task) = self.task.take() {
            self.tracer.with_entry(self.entry, task);
        }
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        if let Some(id) = self.holds.take() {
            self.tracer.release_continuation(id);
        }
        if let Some(id) = self.attached.take() {
            self.tracer.release_hold(id);
        }
    }
}

/// Hook deciding how listener executions are recorded
pub trait ListenerInstrumentation {
    fn should_instrument(&self, target: &EventTarget, event_type: &str) -> bool;

    /// Record the execution; `execute` invokes the original listener
    fn instrument(&self, tracer: &Tracer, event: &Event, listener: &Listener, execute: &dyn Fn());
}

/// Installs the listener and timer wrappers on a host
#[derive(Clone)]
pub struct Instrumentation {
    tracer: Tracer,
    listener_instrumentations: Rc<RefCell<Vec<Rc<dyn ListenerInstrumentation>>>>,
}

impl Instrumentation {
    pub fn new(tracer: Tracer) -> Self {
        Self {
            tracer,
            listener_instrumentations: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Register a listener instrumentation; earlier ones take precedence
    pub fn add_listener_instrumentation(&self, instrumentation: Rc<dyn ListenerInstrumentation>) {
        self.listener_instrumentations.borrow_mut().push(instrumentation);
    }

    fn find_instrumentation(&self, target: &EventTarget, event_type: &str) -> Option<Rc<dyn ListenerInstrumentation>> {
        self.listener_instrumentations
            .borrow()
            .iter()
            .find(|i| i.should_instrument(target, event_type))
            .cloned()
    }

    /// Substitute `addEventListener` and `setTimeout`; missing APIs are skipped
    pub fn install(&self, host: &dyn Host) {
        match host.api(HostApi::AddEventListener) {
            Some(HostFn::AddEventListener(original)) => {
                let instrumentation = self.clone();
                host.replace_api(HostFn::AddEventListener(Rc::new(
                    move |target: &EventTarget, event_type: &str, listener: Listener| {
                        if instrumentation.tracer.context().is_suspended() {
                            original(target, event_type, listener);
                        } else {
                            original(target, event_type, instrumentation.wrap_listener(listener));
                        }
                    },
                )));
                log::debug!("Listener instrumentation installed");
            }
            _ => log::info!("addEventListener not available, listener instrumentation skipped"),
        }

        match host.api(HostApi::SetTimeout) {
            Some(HostFn::SetTimeout(original)) => {
                let tracer = self.tracer.clone();
                host.replace_api(HostFn::SetTimeout(Rc::new(move |delay_ms: u64, task: Task| {
                    if tracer.context().is_suspended() {
                        original(delay_ms, task);
                    } else {
                        let continuation = tracer.capture(task);
                        original(delay_ms, Box::new(move || continuation.run()));
                    }
                })));
                log::debug!("Timer instrumentation installed");
            }
            _ => log::info!("setTimeout not available, timer instrumentation skipped"),
        }
    }

    /// Bind a listener to the frame active at registration
    fn wrap_listener(&self, listener: Listener) -> Listener {
        let captured = self
            .tracer
            .context()
            .current_entry()
            .map(|entry| ContextEntry { deferred: false, ..entry });
        let hold = captured.and_then(|e| e.record()).and_then(|id| self.tracer.hold(id));
        let instrumentation = self.clone();
        let name = listener.name().to_string();

        Listener::new(name, move |event: &Event| {
            // the registering record stays attachable while the listener lives
            let _held = hold.as_ref();
            let tracer = &instrumentation.tracer;
            tracer.with_entry(captured, || {
                match instrumentation.find_instrumentation(&event.target, &event.event_type) {
                    Some(hook) => hook.instrument(tracer, event, &listener, &|| listener.call(event)),
                    None => listener.call(event),
                }
            });
        })
    }
}

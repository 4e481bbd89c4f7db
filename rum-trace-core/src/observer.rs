//! Traversal observers
//!
//! An external traversal driver visits DOM elements and calls
//! [`Tracer::pre_element_begin`](crate::instrumentation::Tracer::pre_element_begin)
//! and [`Tracer::pre_element_finish`](crate::instrumentation::Tracer::pre_element_finish)
//! around each one. Every registered observer sees each call, in registration
//! order.

use crate::dom::NodeId;
use crate::instrumentation::Tracer;
use std::rc::Rc;

/// Reactive hook around element processing
pub trait TraceObserver {
    fn pre_element_begin(&self, _tracer: &Tracer, _element: NodeId) {}

    fn pre_element_finish(&self, _tracer: &Tracer, _element: NodeId) {}
}

/// Ordered list of observers
#[derive(Default, Clone)]
pub struct ObserverRegistry {
    observers: Vec<Rc<dyn TraceObserver>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observer: Rc<dyn TraceObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<dyn TraceObserver>> {
        self.observers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ManualClock;
    use crate::transport::MemoryTransport;
    use chrono::Utc;
    use std::cell::RefCell;

    struct Recorder {
        tag: &'static str,
        calls: Rc<RefCell<Vec<String>>>,
    }

    impl TraceObserver for Recorder {
        fn pre_element_begin(&self, _tracer: &Tracer, element: NodeId) {
            self.calls.borrow_mut().push(format!("{}:begin:{}", self.tag, element.0));
        }

        fn pre_element_finish(&self, _tracer: &Tracer, element: NodeId) {
            self.calls.borrow_mut().push(format!("{}:finish:{}", self.tag, element.0));
        }
    }

    #[test]
    fn test_observers_run_in_registration_order() {
        let tracer = Tracer::new(Rc::new(ManualClock::new(Utc::now())), Box::new(MemoryTransport::new()));
        let calls = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second"] {
            tracer.add_trace_observer(Rc::new(Recorder { tag, calls: Rc::clone(&calls) }));
        }

        tracer.pre_element_begin(NodeId(4));
        tracer.pre_element_finish(NodeId(4));

        assert_eq!(
            *calls.borrow(),
            vec!["first:begin:4", "second:begin:4", "first:finish:4", "second:finish:4"]
        );
    }
}

//! Active trace context
//!
//! The active context is a stack of frames. The top frame decides which record
//! newly created records attach under. Entering a frame returns a
//! [`ContextGuard`] that pops exactly that frame when dropped, so the stack is
//! restored on every exit path, unwinding included.

use crate::types::RecordId;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// One entry of the active-context stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// A record is active
    Record(RecordId),
    /// Attribution is suspended; nothing is active
    Suspended,
}

/// A frame together with its propagation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextEntry {
    pub frame: Frame,
    /// Continuations captured under this entry keep the record open
    pub deferred: bool,
}

impl ContextEntry {
    /// The active record, if any
    pub fn record(&self) -> Option<RecordId> {
        match self.frame {
            Frame::Record(id) => Some(id),
            Frame::Suspended => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StackEntry {
    guard_id: u64,
    entry: ContextEntry,
}

/// Handle to the active-context stack
///
/// Cloning yields another handle to the same stack.
#[derive(Debug, Clone, Default)]
pub struct ActiveContext {
    stack: Rc<RefCell<Vec<StackEntry>>>,
    next_guard_id: Rc<Cell<u64>>,
}

impl ActiveContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a frame; it stays active until the returned guard is dropped
    #[must_use = "the frame is popped as soon as the guard is dropped"]
    pub fn enter(&self, frame: Frame) -> ContextGuard {
        self.enter_entry(ContextEntry { frame, deferred: false })
    }

    /// Push a record frame whose captured continuations keep the record open
    #[must_use = "the frame is popped as soon as the guard is dropped"]
    pub fn enter_deferred(&self, id: RecordId) -> ContextGuard {
        self.enter_entry(ContextEntry { frame: Frame::Record(id), deferred: true })
    }

    /// Push a previously captured entry
    #[must_use = "the frame is popped as soon as the guard is dropped"]
    pub fn enter_entry(&self, entry: ContextEntry) -> ContextGuard {
        let guard_id = self.next_guard_id.get() + 1;
        self.next_guard_id.set(guard_id);
        self.stack.borrow_mut().push(StackEntry { guard_id, entry });
        ContextGuard {
            stack: Rc::clone(&self.stack),
            guard_id,
        }
    }

    /// The top entry of the stack
    pub fn current_entry(&self) -> Option<ContextEntry> {
        self.stack.borrow().last().map(|e| e.entry)
    }

    /// The active record, `None` when the stack is empty or suspended
    pub fn current(&self) -> Option<RecordId> {
        self.current_entry().and_then(|e| e.record())
    }

    /// True if the top frame suspends attribution
    pub fn is_suspended(&self) -> bool {
        matches!(self.current_entry(), Some(ContextEntry { frame: Frame::Suspended, .. }))
    }

    /// Number of frames on the stack
    pub fn depth(&self) -> usize {
        self.stack.borrow().len()
    }

    /// Copy of the stack, bottom first
    pub fn snapshot(&self) -> Vec<ContextEntry> {
        self.stack.borrow().iter().map(|e| e.entry).collect()
    }
}

/// Pops its frame when dropped
#[derive(Debug)]
pub struct ContextGuard {
    stack: Rc<RefCell<Vec<StackEntry>>>,
    guard_id: u64,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let mut stack = self.stack.borrow_mut();
        if let Some(pos) = stack.iter().rposition(|e| e.guard_id == self.guard_id) {
            stack.truncate(pos);
        }
    }
}

//! Beacon transport interface
//!
//! The tracer hands every finished, relevant record tree to a [`Transport`].
//! Batching and the backend wire format are the transport's business.

use crate::types::FinishedTrace;
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

/// Consumer of finished traces
pub trait Transport {
    /// Called once during agent bootstrap
    fn init(&mut self) {}

    /// Accept one finished trace
    fn send(&mut self, trace: FinishedTrace);

    /// Deliver everything still buffered; called on page unload
    fn flush_all(&mut self);
}

#[derive(Debug, Default)]
struct MemoryTransportState {
    initialized: bool,
    pending: Vec<FinishedTrace>,
    delivered: Vec<FinishedTrace>,
    flushes: usize,
}

/// Transport that keeps traces in memory
///
/// Clones share the same buffers, so a test can keep one handle and give the
/// other to the agent.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Rc<RefCell<MemoryTransportState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every trace received so far, delivered or not
    pub fn sent(&self) -> Vec<FinishedTrace> {
        let state = self.state.borrow();
        state.delivered.iter().chain(state.pending.iter()).cloned().collect()
    }

    /// Traces delivered by a flush
    pub fn delivered(&self) -> Vec<FinishedTrace> {
        self.state.borrow().delivered.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.borrow().initialized
    }

    pub fn flush_count(&self) -> usize {
        self.state.borrow().flushes
    }
}

impl Transport for MemoryTransport {
    fn init(&mut self) {
        self.state.borrow_mut().initialized = true;
    }

    fn send(&mut self, trace: FinishedTrace) {
        self.state.borrow_mut().pending.push(trace);
    }

    fn flush_all(&mut self) {
        let mut state = self.state.borrow_mut();
        let pending = std::mem::take(&mut state.pending);
        state.delivered.extend(pending);
        state.flushes += 1;
    }
}

/// Transport writing one JSON document per trace
pub struct JsonLinesTransport<W: Write> {
    writer: W,
    written: usize,
}

impl<W: Write> JsonLinesTransport<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    /// Number of traces written successfully
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_trace(&mut self, trace: &FinishedTrace) -> crate::Result<()> {
        serde_json::to_writer(&mut self.writer, trace)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write> Transport for JsonLinesTransport<W> {
    fn send(&mut self, trace: FinishedTrace) {
        match self.write_trace(&trace) {
            Ok(()) => self.written += 1,
            Err(e) => log::warn!("Failed to write trace {}: {}", trace.id, e),
        }
    }

    fn flush_all(&mut self) {
        if let Err(e) = self.writer.flush() {
            log::warn!("Failed to flush traces: {}", e);
        }
    }
}

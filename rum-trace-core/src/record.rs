//! Trace record store
//!
//! All records of a page view live in a single [`TraceStore`]. Tree edges are
//! record ids, so a child refers to its parent without owning it and the store
//! remains the sole owner of every record.
//!
//! A record is *flush-eligible* when its requirement set is empty, no
//! `build_trace` span is currently executing on it, no deferred continuation
//! captured under it is still pending, and every child is itself
//! flush-eligible. Only roots are flushed: a relevant, flush-eligible root is
//! taken out of the store as a [`FinishedTrace`] with irrelevant descendants
//! pruned.
//!
//! An irrelevant, flush-eligible root is released once no listener or
//! continuation bound to its tree can attach anything under it any more.

use crate::types::{Duration, FinishedTrace, RecordDetails, RecordId, Result, Timestamp, TraceError};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A single mutable trace record
#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub id: RecordId,
    pub details: RecordDetails,
    pub parent: Option<RecordId>,
    pub children: Vec<RecordId>,
    pub enter_timestamp: Option<Timestamp>,
    pub duration: Option<Duration>,
    pub relevant: bool,
    pub requirements: BTreeSet<String>,
    /// Attributes extracted from DOM elements
    pub attributes: BTreeMap<String, String>,
    /// Number of `build_trace` spans currently executing on this record
    pub(crate) active_spans: u32,
    /// Number of captured continuations that keep this record open
    pub(crate) pending_continuations: u32,
    /// Number of listeners and continuations that may still attach under this record
    pub(crate) attach_holds: u32,
}

impl TraceRecord {
    fn new(id: RecordId, details: RecordDetails) -> Self {
        Self {
            id,
            details,
            parent: None,
            children: Vec::new(),
            enter_timestamp: None,
            duration: None,
            relevant: false,
            requirements: BTreeSet::new(),
            attributes: BTreeMap::new(),
            active_spans: 0,
            pending_continuations: 0,
            attach_holds: 0,
        }
    }

    /// True if no span and no deferred continuation is running on this record
    fn is_idle(&self) -> bool {
        self.active_spans == 0 && self.pending_continuations == 0
    }

    /// True if nothing on this record itself blocks completion
    fn is_settled(&self) -> bool {
        self.requirements.is_empty() && self.is_idle()
    }
}

/// Owner of all open trace records
#[derive(Debug, Default)]
pub struct TraceStore {
    records: HashMap<RecordId, TraceRecord>,
    next_id: u64,
}

impl TraceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a record, optionally attached under `parent`
    ///
    /// A parent that is no longer stored is ignored and the record becomes a root.
    pub fn create(&mut self, details: RecordDetails, parent: Option<RecordId>) -> RecordId {
        self.next_id += 1;
        let id = RecordId(self.next_id);
        log::trace!("Created {} record {} (parent {:?})", details.kind(), id, parent);
        self.records.insert(id, TraceRecord::new(id, details));
        if let Some(parent) = parent {
            self.set_parent(id, parent);
        }
        id
    }

    /// Get a record by id
    pub fn get(&self, id: RecordId) -> Option<&TraceRecord> {
        self.records.get(&id)
    }

    /// Get a mutable record by id
    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut TraceRecord> {
        self.records.get_mut(&id)
    }

    /// True if the record is still held by the store
    pub fn contains(&self, id: RecordId) -> bool {
        self.records.contains_key(&id)
    }

    /// Number of records still held by the store
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if the store holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All root records, ordered by id
    pub fn roots(&self) -> Vec<RecordId> {
        let mut roots: Vec<RecordId> = self
            .records
            .values()
            .filter(|r| r.parent.is_none())
            .map(|r| r.id)
            .collect();
        roots.sort_unstable();
        roots
    }

    /// Walk up to the root of `id`
    pub fn root_of(&self, id: RecordId) -> Option<RecordId> {
        let mut current = self.records.get(&id)?;
        while let Some(parent) = current.parent.and_then(|p| self.records.get(&p)) {
            current = parent;
        }
        Some(current.id)
    }

    /// Establish `parent` as the parent of `child`
    ///
    /// Idempotent for an existing edge. An existing edge to another parent is
    /// moved. Edges that would create a cycle are refused.
    pub fn set_parent(&mut self, child: RecordId, parent: RecordId) {
        if !self.contains(child) || !self.contains(parent) {
            log::debug!("Ignoring edge {} -> {}: record closed", parent, child);
            return;
        }
        if self.is_ancestor_or_self(child, parent) {
            log::warn!("Refusing edge {} -> {}: would create a cycle", parent, child);
            return;
        }

        let old_parent = match self.records.get(&child) {
            Some(record) if record.parent == Some(parent) => return,
            Some(record) => record.parent,
            None => return,
        };
        if let Some(old) = old_parent.and_then(|p| self.records.get_mut(&p)) {
            old.children.retain(|c| *c != child);
        }
        if let Some(record) = self.records.get_mut(&child) {
            record.parent = Some(parent);
        }
        if let Some(record) = self.records.get_mut(&parent) {
            record.children.push(child);
        }
    }

    /// Attach `child` under `parent`, same as [`set_parent`](Self::set_parent)
    pub fn attach_child(&mut self, parent: RecordId, child: RecordId) {
        self.set_parent(child, parent);
    }

    /// True if `ancestor` is `id` or one of its ancestors
    fn is_ancestor_or_self(&self, ancestor: RecordId, id: RecordId) -> bool {
        let mut current = Some(id);
        while let Some(cur) = current {
            if cur == ancestor {
                return true;
            }
            current = self.records.get(&cur).and_then(|r| r.parent);
        }
        false
    }

    /// Add a named completion requirement
    ///
    /// Fails with [`TraceError::RecordClosed`] once the record has left the store.
    pub fn require(&mut self, id: RecordId, name: &str) -> Result<()> {
        let record = self.records.get_mut(&id).ok_or(TraceError::RecordClosed(id))?;
        record.requirements.insert(name.to_string());
        Ok(())
    }

    /// Clear a named completion requirement; returns true if it was set
    pub fn mark_complete(&mut self, id: RecordId, name: &str) -> bool {
        match self.records.get_mut(&id) {
            Some(record) => record.requirements.remove(name),
            None => {
                log::debug!("mark_complete({}) on closed record {}", name, id);
                false
            }
        }
    }

    /// Mark a record and every ancestor relevant
    pub fn mark_relevant(&mut self, id: RecordId) {
        let mut current = Some(id);
        while let Some(cur) = current {
            match self.records.get_mut(&cur) {
                Some(record) if record.relevant => break,
                Some(record) => {
                    record.relevant = true;
                    current = record.parent;
                }
                None => {
                    log::debug!("mark_relevant on closed record {}", cur);
                    break;
                }
            }
        }
    }

    /// True if the record is relevant
    pub fn is_relevant(&self, id: RecordId) -> bool {
        self.records.get(&id).is_some_and(|r| r.relevant)
    }

    /// True if the record and its whole subtree are settled
    pub fn is_flush_eligible(&self, id: RecordId) -> bool {
        match self.records.get(&id) {
            Some(record) => {
                record.is_settled() && record.children.iter().all(|c| self.is_flush_eligible(*c))
            }
            None => false,
        }
    }

    /// Register a listener or continuation bound to `id`; false if it is closed
    pub fn hold(&mut self, id: RecordId) -> bool {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.attach_holds += 1;
                true
            }
            None => false,
        }
    }

    /// Drop a hold taken with [`hold`](Self::hold)
    pub fn release(&mut self, id: RecordId) {
        if let Some(record) = self.records.get_mut(&id) {
            record.attach_holds = record.attach_holds.saturating_sub(1);
        }
    }

    /// True if anything in the subtree of `id` is still held
    fn is_held(&self, id: RecordId) -> bool {
        self.records
            .get(&id)
            .is_some_and(|r| r.attach_holds > 0 || r.children.iter().any(|c| self.is_held(*c)))
    }

    /// Set the enter timestamp if not yet set
    pub fn enter(&mut self, id: RecordId, now: Timestamp) {
        if let Some(record) = self.records.get_mut(&id) {
            record.enter_timestamp.get_or_insert(now);
        }
    }

    /// Set the duration, overwriting any earlier value
    pub fn set_duration(&mut self, id: RecordId, duration: Duration) {
        if let Some(record) = self.records.get_mut(&id) {
            record.duration = Some(duration);
        }
    }

    /// Finalise the duration as `now - enter_timestamp` unless already set
    pub fn finish_duration(&mut self, id: RecordId, now: Timestamp) {
        if let Some(record) = self.records.get_mut(&id) {
            if record.duration.is_none() {
                if let Some(enter) = record.enter_timestamp {
                    record.duration = Some(now - enter);
                }
            }
        }
    }

    /// Finalise the duration once no span or deferred continuation runs on `id`
    pub fn finish_if_idle(&mut self, id: RecordId, now: Timestamp) {
        if self.records.get(&id).is_some_and(TraceRecord::is_idle) {
            self.finish_duration(id, now);
        }
    }

    /// Remove a subtree without reporting it
    pub fn discard(&mut self, id: RecordId) {
        let parent = match self.records.get(&id) {
            Some(record) => record.parent,
            None => return,
        };
        if let Some(parent) = parent.and_then(|p| self.records.get_mut(&p)) {
            parent.children.retain(|c| *c != id);
        }
        let removed = self.remove_subtree(id);
        log::debug!("Discarded {} record(s) under {}", removed, id);
    }

    fn remove_subtree(&mut self, id: RecordId) -> usize {
        match self.records.remove(&id) {
            Some(record) => 1 + record.children.iter().map(|c| self.remove_subtree(*c)).sum::<usize>(),
            None => 0,
        }
    }

    /// Root of `id` if that root is relevant and flush-eligible
    pub fn ready_root(&self, id: RecordId) -> Option<RecordId> {
        let root = self.root_of(id)?;
        (self.is_relevant(root) && self.is_flush_eligible(root)).then_some(root)
    }

    /// Root of `id` if that root is irrelevant, flush-eligible and unheld
    pub fn releasable_root(&self, id: RecordId) -> Option<RecordId> {
        let root = self.root_of(id)?;
        (!self.is_relevant(root) && self.is_flush_eligible(root) && !self.is_held(root)).then_some(root)
    }

    /// Take a root out of the store as a finished trace
    ///
    /// Irrelevant descendants are pruned and released together with the tree.
    pub fn take_trace(&mut self, root: RecordId) -> Option<FinishedTrace> {
        let record = self.records.remove(&root)?;
        let mut children = Vec::new();
        for child in &record.children {
            let relevant = self.is_relevant(*child);
            if relevant {
                if let Some(trace) = self.take_trace(*child) {
                    children.push(trace);
                }
            } else {
                self.remove_subtree(*child);
            }
        }
        Some(FinishedTrace {
            id: record.id,
            details: record.details,
            enter_timestamp: record.enter_timestamp,
            duration_ms: record.duration.map(|d| d.num_milliseconds()),
            attributes: record.attributes,
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn instrumented(store: &mut TraceStore, parent: Option<RecordId>) -> RecordId {
        store.create(RecordDetails::instrumented("op"), parent)
    }

    #[test]
    fn test_create_attaches_to_parent() {
        let mut store = TraceStore::new();
        let root = instrumented(&mut store, None);
        let child = instrumented(&mut store, Some(root));

        assert_eq!(store.get(child).unwrap().parent, Some(root));
        assert_eq!(store.get(root).unwrap().children, vec![child]);
        assert_eq!(store.roots(), vec![root]);
    }

    #[test]
    fn test_set_parent_is_idempotent_and_moves_edges() {
        let mut store = TraceStore::new();
        let a = instrumented(&mut store, None);
        let b = instrumented(&mut store, None);
        let child = instrumented(&mut store, Some(a));

        store.set_parent(child, a);
        store.attach_child(a, child);
        assert_eq!(store.get(a).unwrap().children, vec![child]);

        store.set_parent(child, b);
        assert!(store.get(a).unwrap().children.is_empty());
        assert_eq!(store.get(b).unwrap().children, vec![child]);
    }

    #[test]
    fn test_cycles_are_refused() {
        let mut store = TraceStore::new();
        let root = instrumented(&mut store, None);
        let child = instrumented(&mut store, Some(root));

        store.set_parent(root, child);
        store.set_parent(root, root);
        assert_eq!(store.get(root).unwrap().parent, None);
    }

    #[test]
    fn test_mark_relevant_walks_ancestors() {
        let mut store = TraceStore::new();
        let root = instrumented(&mut store, None);
        let mid = instrumented(&mut store, Some(root));
        let leaf = instrumented(&mut store, Some(mid));
        let sibling = instrumented(&mut store, Some(root));

        store.mark_relevant(leaf);
        assert!(store.is_relevant(leaf));
        assert!(store.is_relevant(mid));
        assert!(store.is_relevant(root));
        assert!(!store.is_relevant(sibling));
    }

    #[test]
    fn test_eligibility_requires_settled_children() {
        let mut store = TraceStore::new();
        let root = instrumented(&mut store, None);
        let child = instrumented(&mut store, Some(root));
        store.require(child, "timings").unwrap();

        assert!(!store.is_flush_eligible(root));
        assert!(store.mark_complete(child, "timings"));
        assert!(!store.mark_complete(child, "timings"));
        assert!(store.is_flush_eligible(root));
    }

    #[test]
    fn test_discarded_child_no_longer_blocks() {
        let mut store = TraceStore::new();
        let root = instrumented(&mut store, None);
        let child = instrumented(&mut store, Some(root));
        let grandchild = instrumented(&mut store, Some(child));
        store.require(grandchild, "never").unwrap();

        assert!(!store.is_flush_eligible(root));
        store.discard(child);
        assert!(!store.contains(grandchild));
        assert!(store.is_flush_eligible(root));
    }

    #[test]
    fn test_closed_records_are_noops() {
        let mut store = TraceStore::new();
        let root = instrumented(&mut store, None);
        store.mark_relevant(root);
        assert!(store.take_trace(root).is_some());

        assert!(matches!(store.require(root, "late"), Err(TraceError::RecordClosed(id)) if id == root));
        assert!(!store.mark_complete(root, "late"));
        store.mark_relevant(root);
        let orphan = instrumented(&mut store, Some(root));
        assert_eq!(store.get(orphan).unwrap().parent, None);
    }

    #[test]
    fn test_take_trace_prunes_irrelevant_children() {
        let mut store = TraceStore::new();
        let root = instrumented(&mut store, None);
        let kept = instrumented(&mut store, Some(root));
        let pruned = instrumented(&mut store, Some(root));
        store.mark_relevant(kept);

        assert_eq!(store.ready_root(pruned), Some(root));
        let trace = store.take_trace(root).unwrap();
        assert_eq!(trace.children.len(), 1);
        assert_eq!(trace.children[0].id, kept);
        assert!(store.is_empty());
    }

    #[test]
    fn test_releasable_root_waits_for_holds() {
        let mut store = TraceStore::new();
        let root = instrumented(&mut store, None);
        let child = instrumented(&mut store, Some(root));

        assert!(store.hold(child));
        assert_eq!(store.releasable_root(root), None);
        store.release(child);
        assert_eq!(store.releasable_root(child), Some(root));

        store.mark_relevant(child);
        assert_eq!(store.releasable_root(root), None);
        assert_eq!(store.ready_root(root), Some(root));
    }

    #[test]
    fn test_finish_if_idle_skips_busy_records() {
        let mut store = TraceStore::new();
        let id = instrumented(&mut store, None);
        let start = Utc.timestamp_millis_opt(1_000).unwrap();
        store.enter(id, start);
        store.get_mut(id).unwrap().pending_continuations = 1;

        store.finish_if_idle(id, start + Duration::milliseconds(10));
        assert_eq!(store.get(id).unwrap().duration, None);

        store.get_mut(id).unwrap().pending_continuations = 0;
        store.finish_if_idle(id, start + Duration::milliseconds(30));
        assert_eq!(store.get(id).unwrap().duration, Some(Duration::milliseconds(30)));
    }

    #[test]
    fn test_finish_duration_keeps_existing_value() {
        let mut store = TraceStore::new();
        let id = instrumented(&mut store, None);
        let start = Utc.timestamp_millis_opt(1_000).unwrap();
        store.enter(id, start);
        store.finish_duration(id, start + Duration::milliseconds(120));
        assert_eq!(store.get(id).unwrap().duration, Some(Duration::milliseconds(120)));

        store.finish_duration(id, start + Duration::milliseconds(500));
        assert_eq!(store.get(id).unwrap().duration, Some(Duration::milliseconds(120)));
    }
}

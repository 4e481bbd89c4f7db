//! Core types for the RUM trace core
//!
//! This module defines the fundamental identifiers, record payloads and errors
//! shared by every other module. Records themselves live in the
//! [`TraceStore`](crate::record::TraceStore); everything here is plain data.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp type used throughout the agent
pub type Timestamp = DateTime<Utc>;

/// Duration type used for record durations
pub type Duration = TimeDelta;

/// Result type for trace operations
pub type Result<T> = std::result::Result<T, TraceError>;

/// Identifier of a trace record inside a [`TraceStore`](crate::record::TraceStore)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Errors that can occur while building traces
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("Record {0} is closed (already flushed or discarded)")]
    RecordClosed(RecordId),

    #[error("Invalid selector configuration: {0}")]
    InvalidSelector(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Plugin {0} rejected (duplicate name or agent already initialized)")]
    PluginRejected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// How a URL change was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Initiator {
    /// `history.pushState` was called
    PushState,
    /// `history.replaceState` was called
    ReplaceState,
    /// A `popstate` or `hashchange` listener observed the change
    Navigation,
    /// The change was discovered by a traversal observer
    HashModified,
}

impl fmt::Display for Initiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Initiator::PushState => write!(f, "PUSHSTATE"),
            Initiator::ReplaceState => write!(f, "REPLACESTATE"),
            Initiator::Navigation => write!(f, "NAVIGATION"),
            Initiator::HashModified => write!(f, "HASHMODIFIED"),
        }
    }
}

/// Variant-specific payload of a trace record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RecordDetails {
    /// The root record of a page view
    PageLoad {
        /// Location at agent start
        url: Option<String>,
        /// Backend-issued trace id, only set when the page was freshly delivered
        backend_trace_id: Option<String>,
    },

    /// Execution of a single event listener
    ListenerExecution {
        /// Name of the listener function (may be empty for anonymous ones)
        function_name: String,
        /// Event type that triggered the listener
        event_type: String,
    },

    /// A change of the page URL without a full navigation
    UrlChange {
        /// URL before the change
        last_url: String,
        /// URL after the change
        new_url: String,
        /// How the change was detected; set once known
        initiator: Option<Initiator>,
    },

    /// A generic instrumented unit of work
    Instrumented {
        /// Name of the instrumented operation
        name: String,
    },
}

impl RecordDetails {
    /// Details for a fresh page-load record
    pub fn page_load(url: Option<String>, backend_trace_id: Option<String>) -> Self {
        RecordDetails::PageLoad { url, backend_trace_id }
    }

    /// Details for a listener execution record
    pub fn listener(function_name: impl Into<String>, event_type: impl Into<String>) -> Self {
        RecordDetails::ListenerExecution {
            function_name: function_name.into(),
            event_type: event_type.into(),
        }
    }

    /// Details for a URL change record with no initiator yet
    pub fn url_change(last_url: impl Into<String>, new_url: impl Into<String>) -> Self {
        RecordDetails::UrlChange {
            last_url: last_url.into(),
            new_url: new_url.into(),
            initiator: None,
        }
    }

    /// Details for a generic instrumented record
    pub fn instrumented(name: impl Into<String>) -> Self {
        RecordDetails::Instrumented { name: name.into() }
    }

    /// Short kind name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            RecordDetails::PageLoad { .. } => "pageload",
            RecordDetails::ListenerExecution { .. } => "listener",
            RecordDetails::UrlChange { .. } => "urlchange",
            RecordDetails::Instrumented { .. } => "instrumented",
        }
    }
}

/// A finished, relevant record tree as handed to the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedTrace {
    pub id: RecordId,
    #[serde(flatten)]
    pub details: RecordDetails,
    pub enter_timestamp: Option<Timestamp>,
    /// Duration in milliseconds
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FinishedTrace>,
}

impl FinishedTrace {
    /// Total number of records in this tree
    pub fn record_count(&self) -> usize {
        1 + self.children.iter().map(|c| c.record_count()).sum::<usize>()
    }

    /// Depth-first search for the first record matching `pred`
    pub fn find(&self, pred: &dyn Fn(&FinishedTrace) -> bool) -> Option<&FinishedTrace> {
        if pred(self) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(pred))
    }
}

//! Core types for wirekit

use crate::error::Error;
use crate::http::HttpResponse;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identifier of one logical call
///
/// Derived from the endpoint identifier plus a creation timestamp and a random
/// suffix. Retries of the same call reuse the id, which keys the retry state.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Create a fresh id for a call against `endpoint`
    pub fn generate(endpoint: &EndpointIdentifier) -> Self {
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let suffix: u32 = rand::random();
        Self(format!("{}_{}_{:08x}", endpoint.0, nanos, suffix))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of a logical request type
///
/// Built from method, path and sorted query items only, so identical logical
/// calls collapse to the same identifier. Used for debug-capture file names
/// and replay lookup.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointIdentifier(pub String);

impl EndpointIdentifier {
    /// Build an identifier from a method, URL path and already-encoded query
    pub fn new(method: &str, path: &str, query: Option<&str>) -> Self {
        let mut raw = format!("{}_{}", method, path);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            raw.push('_');
            raw.push_str(query);
        }
        Self(crate::utils::sanitize_identifier(&raw))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EndpointIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session identifier used to group debug captures
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// New session id based on the current time
    pub fn generate() -> Self {
        Self(chrono::Utc::now().format("%Y%m%d%H%M%S%3f").to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::generate()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of an upload or download task
///
/// Derived from the request id of the call that created the task; stays the
/// same when the transport handle is replaced on retry.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl From<&RequestId> for TaskId {
    fn from(id: &RequestId) -> Self {
        Self(id.0.clone())
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport-level status of a transfer task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Registered, transport not started yet
    Created,
    /// Bytes are moving
    Running,
    /// Paused by the user
    Suspended,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled by the user
    Cancelled,
}

impl TransferStatus {
    /// Whether no further transport events will arrive for this task
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransferStatus::Created => "created",
            TransferStatus::Running => "running",
            TransferStatus::Suspended => "suspended",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Callback from a transfer transport into its manager
///
/// Transports run on their own tasks and report through an mpsc channel that
/// the owning manager drains into its registry.
#[derive(Debug)]
pub enum TransferEvent {
    /// Bytes moved
    Progress {
        /// Task the progress belongs to
        task_id: TaskId,
        /// Bytes transferred so far
        transferred: u64,
        /// Expected total, when known
        total: Option<u64>,
    },

    /// Transfer finished successfully
    Completed {
        /// Task that finished
        task_id: TaskId,
        /// Final response, when the transport has one
        response: Option<HttpResponse>,
        /// Temporary file holding downloaded data
        location: Option<PathBuf>,
    },

    /// Transfer failed or was cancelled
    Failed {
        /// Task that failed
        task_id: TaskId,
        /// Why
        error: Error,
        /// Partial data usable to resume a download
        resume_data: Option<Bytes>,
    },
}

impl TransferEvent {
    /// Task the event belongs to
    pub fn task_id(&self) -> &TaskId {
        match self {
            TransferEvent::Progress { task_id, .. }
            | TransferEvent::Completed { task_id, .. }
            | TransferEvent::Failed { task_id, .. } => task_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_identifier_is_stable_for_same_inputs() {
        let a = EndpointIdentifier::new("GET", "/users", Some("page=2"));
        let b = EndpointIdentifier::new("GET", "/users", Some("page=2"));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "GET_-users_page-2");
    }

    #[test]
    fn request_ids_differ_between_calls() {
        let endpoint = EndpointIdentifier::new("GET", "/users", None);
        let a = RequestId::generate(&endpoint);
        let b = RequestId::generate(&endpoint);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("GET_-users_"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
        assert!(TransferStatus::Cancelled.is_terminal());
        assert!(!TransferStatus::Suspended.is_terminal());
        assert!(!TransferStatus::Running.is_terminal());
    }
}

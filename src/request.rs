//! Requests: the unit of pending or in-flight fetch work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A URL that needs to be turned into a resource by fetching. Requests are
/// held in a [`crate::request_store::RequestStore`], placed on a
/// [`crate::queue::Queue`], and consumed by workers.
///
/// At most one Request exists per normalized URL; re-discovering a URL
/// updates the existing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Job this request belongs to.
    pub job_id: String,
    /// Normalized URL, the request's identity.
    pub url: String,
    /// Current lifecycle state.
    pub status: RequestStatus,
    /// Earliest time a retry should be issued, when set.
    pub fetch_after: Option<DateTime<Utc>>,
    /// Number of responses observed for this URL so far.
    pub attempts_made: u32,
    /// HTTP status of the most recent response, 0 before any attempt.
    pub prev_response_status: u16,
}

impl Request {
    /// Create a fresh request for a normalized URL.
    pub fn new(job_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            url: url.into(),
            status: RequestStatus::Unknown,
            fetch_after: None,
            attempts_made: 0,
            prev_response_status: 0,
        }
    }
}

/// All states a request can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Default state, nothing known yet.
    #[default]
    Unknown,
    /// Needs fetching but is not queued.
    Fetch,
    /// Queued for fetching.
    Queued,
    /// Currently being fetched by a worker.
    Requesting,
    /// Successfully completed.
    Done,
    /// Cannot be completed.
    Failed,
}

impl RequestStatus {
    /// Terminal states never re-enter the queue.
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Done | RequestStatus::Failed)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestStatus::Unknown => "unknown",
            RequestStatus::Fetch => "fetch",
            RequestStatus::Queued => "queued",
            RequestStatus::Requesting => "requesting",
            RequestStatus::Done => "done",
            RequestStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_request_defaults() {
        let r = Request::new("job-1", "http://example.com/a");
        assert_eq!(r.status, RequestStatus::Unknown);
        assert_eq!(r.attempts_made, 0);
        assert_eq!(r.prev_response_status, 0);
        assert!(r.fetch_after.is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(RequestStatus::Done.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
        assert!(!RequestStatus::Queued.is_terminal());
        assert!(!RequestStatus::Requesting.is_terminal());
    }
}

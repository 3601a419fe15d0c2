//! Enqueue options and the wire shapes exchanged with a processor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Options attached to each enqueue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Higher priorities run first; ties break on insertion order.
    pub priority: i64,
    /// Earliest eligibility. `None` means eligible immediately; a time in
    /// the past is permitted and equivalent.
    pub not_before: Option<DateTime<Utc>>,
    /// If set, re-queueing a key that is already queued or in progress is a
    /// no-op (first enqueue wins). Dead-lettered keys are still resurrected.
    pub deduplicate: bool,
}

impl QueueOptions {
    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set an absolute earliest-eligibility time.
    #[must_use]
    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    /// Delay eligibility by `delay` from now.
    #[must_use]
    pub fn delayed_by(mut self, delay: std::time::Duration) -> Self {
        self.not_before = Some(Utc::now() + delay);
        self
    }

    /// Mark the enqueue as deduplicating (first enqueue wins).
    #[must_use]
    pub fn deduplicated(mut self) -> Self {
        self.deduplicate = true;
        self
    }
}

/// A child enqueue requested by a processor as part of a fanout.
///
/// A child whose key equals the key being processed is the documented way
/// for a reconciler to requeue itself after a delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueKeyRequest {
    /// The work key to enqueue.
    pub key: String,
    /// Priority for the child; defaults to 0.
    #[serde(default)]
    pub priority: i64,
    /// Eligibility delay in seconds from enqueue time; defaults to 0.
    #[serde(default)]
    pub delay_seconds: i64,
}

impl QueueKeyRequest {
    /// A child enqueue with default priority and no delay.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            priority: 0,
            delay_seconds: 0,
        }
    }

    /// Set the child's priority.
    #[must_use]
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the child's eligibility delay in seconds.
    #[must_use]
    pub fn delay_seconds(mut self, delay_seconds: i64) -> Self {
        self.delay_seconds = delay_seconds;
        self
    }

    /// Resolve into [`QueueOptions`], turning `delay_seconds` into an
    /// absolute `not_before` relative to now.
    pub fn options(&self) -> QueueOptions {
        let mut opts = QueueOptions::default().with_priority(self.priority);
        if self.delay_seconds > 0 {
            opts.not_before = Some(Utc::now() + chrono::Duration::seconds(self.delay_seconds));
        }
        opts
    }
}

/// The enqueue wire shape: one key with its scheduling parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// The work key to enqueue.
    pub key: String,
    /// Priority; defaults to 0.
    #[serde(default)]
    pub priority: i64,
    /// Eligibility delay in seconds from enqueue time; defaults to 0.
    #[serde(default)]
    pub delay_seconds: i64,
    /// First-wins dedup; defaults to off.
    #[serde(default)]
    pub deduplicate: bool,
}

impl EnqueueRequest {
    /// Resolve into [`QueueOptions`], turning `delay_seconds` into an
    /// absolute `not_before` relative to now.
    pub fn options(&self) -> QueueOptions {
        let mut opts = QueueOptions::default().with_priority(self.priority);
        if self.delay_seconds > 0 {
            opts.not_before = Some(Utc::now() + chrono::Duration::seconds(self.delay_seconds));
        }
        opts.deduplicate = self.deduplicate;
        opts
    }
}

/// One processor invocation: the key under reconcile plus its queue context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRequest {
    /// The work key.
    pub key: String,
    /// The key's current priority.
    #[serde(default)]
    pub priority: i64,
    /// Completed attempts for this key so far.
    #[serde(default)]
    pub attempts: u32,
}

/// The processor's verdict for one invocation.
///
/// `queue_keys` and `requeue_after_seconds` are independent fields of the
/// wire shape; an empty response means the key is complete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResponse {
    /// Children to enqueue; the current key completes once all succeed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queue_keys: Vec<QueueKeyRequest>,
    /// Re-run the current key after this many seconds, without counting an
    /// attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_after_seconds: Option<i64>,
}

impl ProcessResponse {
    /// Whether this response carries no follow-up work, i.e. "complete".
    pub fn is_complete(&self) -> bool {
        self.queue_keys.is_empty() && self.requeue_after_seconds.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::{ProcessResponse, QueueKeyRequest, QueueOptions};
    use chrono::Utc;

    #[test]
    fn queue_key_request_resolves_delay() {
        let before = Utc::now();
        let opts = QueueKeyRequest::new("k").priority(5).delay_seconds(30).options();
        assert_eq!(opts.priority, 5);
        let not_before = opts.not_before.unwrap();
        assert!(not_before >= before + chrono::Duration::seconds(30));
        assert!(not_before <= Utc::now() + chrono::Duration::seconds(30));
    }

    #[test]
    fn zero_delay_is_immediately_eligible() {
        let opts = QueueKeyRequest::new("k").options();
        assert_eq!(opts.not_before, None);
        assert!(!opts.deduplicate);
    }

    #[test]
    fn empty_response_serializes_empty() {
        let resp = ProcessResponse::default();
        assert!(resp.is_complete());
        assert_eq!(serde_json::to_string(&resp).unwrap(), "{}");
    }

    #[test]
    fn response_wire_shape() {
        let resp: ProcessResponse = serde_json::from_str(
            r#"{"queue_keys":[{"key":"a","priority":2},{"key":"b","delay_seconds":30}]}"#,
        )
        .unwrap();
        assert_eq!(resp.queue_keys.len(), 2);
        assert_eq!(resp.queue_keys[0].priority, 2);
        assert_eq!(resp.queue_keys[1].delay_seconds, 30);
        assert_eq!(resp.requeue_after_seconds, None);
        assert!(!resp.is_complete());
    }

    #[test]
    fn enqueue_request_defaults_and_dedup_carry_through() {
        let req: super::EnqueueRequest =
            serde_json::from_str(r#"{"key":"k","deduplicate":true}"#).unwrap();
        assert_eq!(req.priority, 0);
        assert_eq!(req.delay_seconds, 0);
        let opts = req.options();
        assert!(opts.deduplicate);
        assert_eq!(opts.not_before, None);
    }

    #[test]
    fn options_builder_composes() {
        let opts = QueueOptions::default().with_priority(9).deduplicated();
        assert_eq!(opts.priority, 9);
        assert!(opts.deduplicate);
        assert_eq!(opts.not_before, None);
    }
}

//! Queue client counters
//!
//! - `queue_responses_total` (counter): labels `queue`, `verdict`
//! - `queue_rotations_total` (counter): labels `queue`, `reason`
//! - `queue_transport_retries_total` (counter): label `queue`
//!
//! No recorder is installed here; the embedding binary decides where the
//! counters go.

/// Record a classified response.
pub fn record_response(queue: &str, verdict: &str) {
    ::metrics::counter!("queue_responses_total", "queue" => queue.to_string(), "verdict" => verdict.to_string())
        .increment(1);
}

/// Record a credential rotation and why it happened.
pub fn record_rotation(queue: &str, reason: &str) {
    ::metrics::counter!("queue_rotations_total", "queue" => queue.to_string(), "reason" => reason.to_string())
        .increment(1);
}

/// Record a same-credential retry after a transient failure.
pub fn record_transport_retry(queue: &str) {
    ::metrics::counter!("queue_transport_retries_total", "queue" => queue.to_string()).increment(1);
}

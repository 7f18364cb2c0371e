//! Metric names and descriptions.
//!
//! All metric names are defined here so every crate records under the same
//! name. Callers use the `metrics` facade macros with these constants; no
//! exporter is installed by the libraries.
//!
//! # Naming
//!
//! - prefix: `intelflow_`
//! - suffix: `_total` (counter), `_seconds` (histogram)
//!
//! # Example
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(intelflow_core::metrics::MESSAGES_SENT_TOTAL, "path" => "_default").increment(1);
//! ```

// --- label keys ---

/// Bot id label key.
pub const LABEL_BOT: &str = "bot_id";

/// Queue name label key.
pub const LABEL_QUEUE: &str = "queue";

/// Destination path label key (`_default`, ...).
pub const LABEL_PATH: &str = "path";

/// Queue operation label key (push, pop, acknowledge).
pub const LABEL_OPERATION: &str = "operation";

// --- message core ---

/// Values rejected by a harmonization type (counter)
pub const SANITIZE_FAILURES_TOTAL: &str = "intelflow_sanitize_failures_total";

// --- pipeline ---

/// Messages received from the source queue (counter)
pub const MESSAGES_RECEIVED_TOTAL: &str = "intelflow_messages_received_total";

/// Messages pushed to destination queues (counter, label: path)
pub const MESSAGES_SENT_TOTAL: &str = "intelflow_messages_sent_total";

/// Messages acknowledged on the source queue (counter)
pub const MESSAGES_ACKNOWLEDGED_TOTAL: &str = "intelflow_messages_acknowledged_total";

/// Queue operations retried after a connection failure (counter, label: operation)
pub const PIPELINE_RETRIES_TOTAL: &str = "intelflow_pipeline_retries_total";

// --- bot runtime ---

/// Failed `process()` calls (counter)
pub const PROCESS_ERRORS_TOTAL: &str = "intelflow_process_errors_total";

/// Messages written to the error dump (counter)
pub const MESSAGES_DUMPED_TOTAL: &str = "intelflow_messages_dumped_total";

/// Time spent in one `process()` call (histogram, seconds)
pub const PROCESS_DURATION_SECONDS: &str = "intelflow_process_duration_seconds";

/// Buckets for [`PROCESS_DURATION_SECONDS`], 100us to 10s.
pub const PROCESS_DURATION_BUCKETS: [f64; 10] = [
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 10.0,
];

/// Registers descriptions for every metric.
///
/// Call once after installing a recorder.
pub fn describe_all() {
    use metrics::{describe_counter, describe_histogram};

    describe_counter!(
        SANITIZE_FAILURES_TOTAL,
        "Values rejected by a harmonization type"
    );
    describe_counter!(
        MESSAGES_RECEIVED_TOTAL,
        "Messages received from the source queue"
    );
    describe_counter!(
        MESSAGES_SENT_TOTAL,
        "Messages pushed to destination queues"
    );
    describe_counter!(
        MESSAGES_ACKNOWLEDGED_TOTAL,
        "Messages acknowledged on the source queue"
    );
    describe_counter!(
        PIPELINE_RETRIES_TOTAL,
        "Queue operations retried after a connection failure"
    );
    describe_counter!(PROCESS_ERRORS_TOTAL, "Failed process() calls");
    describe_counter!(MESSAGES_DUMPED_TOTAL, "Messages written to the error dump");
    describe_histogram!(
        PROCESS_DURATION_SECONDS,
        "Time spent processing one message in seconds"
    );
}

use std::sync::Weak;

use crate::event::LogEvent;

/// Outcome of an asynchronous pull delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullResult {
    Success,
    Fail,
}

/// A producer-side hook invoked when a scheduled pull completes.
pub trait PullDataReceiver: Send + Sync {
    fn on_data_pulled(&self, data: Vec<LogEvent>, result: PullResult, original_pull_time_ns: i64);
}

/// External registry of pull sources keyed by tag id.
///
/// Synchronous pulls return the current atom batch for a tag; scheduled
/// pulls deliver through registered receivers. Callers enforce their own
/// max-delay contract on the results.
pub trait PullerManager: Send + Sync {
    /// Fetches all current atoms for the tag. `None` signals pull failure.
    fn pull(&self, tag_id: i32, timestamp_ns: i64) -> Option<Vec<LogEvent>>;

    /// Registers a receiver for scheduled pulls of the tag. The receiver is
    /// held weakly; a torn-down producer resolves to a clean no-op.
    fn register_receiver(
        &self,
        tag_id: i32,
        receiver: Weak<dyn PullDataReceiver>,
        next_pull_ns: i64,
        interval_ns: i64,
    );

    /// Removes the receiver registration for the tag.
    fn unregister_receiver(&self, tag_id: i32);
}

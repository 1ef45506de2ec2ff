//! Row models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Batching logic
//! lives in the scheduler modules.

use crate::model::{PendingRequest, Pod, VideoStats};

/// Pending QADU row joined with the current counters of its video and the
/// destination pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QaduRequestRow {
    pub request: PendingRequest,
    pub video: VideoStats,
    pub pod: Pod,
}

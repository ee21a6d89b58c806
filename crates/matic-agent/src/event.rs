//! Events surfaced by the manager to its handles.
//!
//! The manager never blocks callers: completions and lifecycle changes are
//! queued as events, drained with [`crate::AgentManager::take_events`].

use crate::job::JobId;
use crate::manager::HandleId;

/// Report of one finished job, kept until the owning handle collects it.
#[derive(Debug, Clone)]
pub struct FinishedJob {
    pub job: JobId,
    pub handle: HandleId,
    /// Job kind, e.g. `download` or `run`.
    pub name: String,
    /// One-line completion summary.
    pub summary: String,
    /// Captured output: file content, command output, walk decisions.
    pub output: String,
    /// Recorded (errno, message) pair when the job failed.
    pub error: Option<(u32, String)>,
    pub cancelled: bool,
}

impl FinishedJob {
    /// Whether the job ran to completion without a recorded error.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && !self.cancelled
    }
}

/// Manager-level notification.
#[derive(Debug, Clone)]
pub enum Event {
    /// A pending connect resolved against an announced agent.
    Connected {
        handle: HandleId,
        channel_id: String,
    },
    /// A job reached a terminal state.
    JobFinished(FinishedJob),
    /// A channel went stale or retired; its handles are stale too.
    ChannelLost {
        channel_id: String,
        reason: String,
    },
}

//! Jobs: user-visible units of work composed of protocol operations.
//!
//! The operation sequence is produced lazily by a [`JobPlan`], an explicit
//! state machine advanced once per operation boundary: the driver hands the
//! finished operation back to the plan and receives the next one. The
//! shared [`Job`] driver owns the in-flight operation, the request/reply
//! lock-step counters, the cancel/done flags and the recorded error.

mod control;
mod dir;
mod run;
mod transfer;

pub use control::{PollIntervalPlan, QuitPlan, RestartPlan, TimeSyncPlan};
pub use dir::{DownloadDirPlan, ListDirPlan, UploadDirPlan, WalkPolicy};
pub use run::RunPlan;
pub use transfer::{DownloadPlan, PrintFilePlan, UploadPlan};

use std::time::Duration;

use tracing::{debug, warn};

use matic_core::proto::Buffer;
use matic_core::{Error, Result};

use crate::ops::Op;

/// Identifier of a queued job, unique per manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job{}", self.0)
    }
}

/// Lazily produces the operation sequence of a job.
///
/// `next_op` receives the operation that just finished (`None` on the first
/// call) and returns the next one, `None` when the plan is exhausted, or an
/// error to fail the job. Failed operations are handed back like any other;
/// the plan decides whether an agent errno is fatal.
pub trait JobPlan: Send {
    /// Advance the plan past the finished operation.
    fn next_op(&mut self, finished: Option<Op>) -> Result<Option<Op>>;

    /// Output captured for the user, drained at completion.
    fn output(&mut self) -> String {
        String::new()
    }

    /// One-line completion summary.
    fn summary(&self) -> String;

    /// New agent poll interval to adopt once the job completes.
    fn poll_interval_update(&self) -> Option<Duration> {
        None
    }

    /// Whether the owning channel retires when this job completes.
    fn retires_channel(&self) -> bool {
        false
    }
}

/// Driver for one unit of work: a plan plus lock-step bookkeeping.
pub struct Job {
    name: String,
    plan: Box<dyn JobPlan>,
    op: Option<Op>,
    requests: u64,
    replies: u64,
    cancelled: bool,
    done: bool,
    error: Option<(u32, String)>,
    output: String,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("requests", &self.requests)
            .field("replies", &self.replies)
            .field("done", &self.done)
            .field("cancelled", &self.cancelled)
            .field("error", &self.error)
            .finish()
    }
}

impl Job {
    /// Wrap a plan into a runnable job.
    pub fn new(name: impl Into<String>, plan: Box<dyn JobPlan>) -> Job {
        Job {
            name: name.into(),
            plan,
            op: None,
            requests: 0,
            replies: 0,
            cancelled: false,
            done: false,
            output: String::new(),
            error: None,
        }
    }

    /// Populate the next outgoing request.
    ///
    /// Returns `Ok(true)` when `buf` now carries a request, `Ok(false)` when
    /// the job has finished and has nothing more to send. Only a violation
    /// of the request/reply lock-step escapes as an error; operation and
    /// plan failures are recorded on the job instead.
    pub fn next_request(&mut self, buf: &mut Buffer) -> Result<bool> {
        loop {
            if self.done {
                return Ok(false);
            }
            let current_finished = self.op.as_ref().map_or(true, Op::is_finished);
            if self.cancelled && current_finished {
                debug!(job = %self.name, "cancelled job wound down");
                self.finish();
                return Ok(false);
            }
            if current_finished {
                if !self.advance_plan() {
                    return Ok(false);
                }
            }
            let Some(op) = self.op.as_mut() else {
                return Ok(false);
            };
            buf.set_opcode(op.opcode());
            match op.send_request(buf) {
                Ok(()) => {
                    self.requests += 1;
                    if self.requests > self.replies + 1 {
                        return Err(Error::job(format!(
                            "request/reply lock-step violated: {} requests, {} replies",
                            self.requests, self.replies
                        )));
                    }
                    return Ok(true);
                }
                // Exhausted data source: operation complete, keep advancing.
                Err(Error::EndOfData) => continue,
                Err(e) => {
                    warn!(job = %self.name, error = %e, "request population failed");
                    self.record_failure(0, e.to_string());
                    return Ok(false);
                }
            }
        }
    }

    /// Feed the reply for the outstanding request into the active operation.
    ///
    /// Protocol violations are recorded on the job and the job is abandoned;
    /// they surface later through the finished-job report, not here. Only a
    /// reply arriving without an outstanding request is raised.
    pub fn next_response(&mut self, buf: &mut Buffer) -> Result<()> {
        self.replies += 1;
        if self.replies > self.requests {
            return Err(Error::job(format!(
                "reply without outstanding request: {} requests, {} replies",
                self.requests, self.replies
            )));
        }
        let Some(op) = self.op.as_mut() else {
            return Err(Error::job("reply with no operation in flight"));
        };
        if let Err(e) = op.parse_reply(buf) {
            warn!(job = %self.name, error = %e, "reply violated protocol, abandoning job");
            self.record_failure(0, e.to_string());
        }
        Ok(())
    }

    /// Pull the next operation out of the plan. Returns false when the job
    /// finished (plan exhausted or plan-reported failure).
    fn advance_plan(&mut self) -> bool {
        let finished = self.op.take();
        // Keep the agent errno of a failed op for the recorded error.
        let op_error = finished
            .as_ref()
            .filter(|op| op.failed())
            .and_then(|op| op.error().map(|(e, m)| (e, m.to_string())));
        match self.plan.next_op(finished) {
            Ok(Some(next)) => {
                self.op = Some(next);
                true
            }
            Ok(None) => {
                self.finish();
                false
            }
            Err(e) => {
                let (errno, message) = op_error.unwrap_or((0, e.to_string()));
                debug!(job = %self.name, errno, %message, "plan reported failure");
                self.record_failure(errno, message);
                false
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        if self.output.is_empty() {
            self.output = self.plan.output();
        }
    }

    /// Record a terminal failure and abandon any remaining operations.
    pub fn record_failure(&mut self, errno: u32, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some((errno, message.into()));
        }
        self.finish();
    }

    /// Request cancellation. An in-flight exchange resolves first; the job
    /// winds down at the next request boundary.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Recorded (errno, message) pair, if the job failed.
    pub fn error(&self) -> Option<(u32, &str)> {
        self.error.as_ref().map(|(e, m)| (*e, m.as_str()))
    }

    /// Captured output, populated at completion.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Completion summary from the plan.
    pub fn summary(&self) -> String {
        if self.cancelled {
            format!("{} cancelled", self.name)
        } else if let Some((errno, message)) = &self.error {
            format!("{} failed (errno {errno}): {message}", self.name)
        } else {
            self.plan.summary()
        }
    }

    /// Requests sent so far.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Replies consumed so far.
    pub fn replies(&self) -> u64 {
        self.replies
    }

    pub(crate) fn poll_interval_update(&self) -> Option<Duration> {
        self.plan.poll_interval_update()
    }

    pub(crate) fn retires_channel(&self) -> bool {
        self.plan.retires_channel()
    }
}

/// Fail the job if the finished operation carried an agent error.
pub(crate) fn require_ok(what: &str, op_error: Option<(u32, &str)>, failed: bool) -> Result<()> {
    if let Some((errno, message)) = op_error {
        return Err(Error::job(format!("{what} failed: errno {errno}: {message}")));
    }
    if failed {
        return Err(Error::job(format!("{what} failed")));
    }
    Ok(())
}

/// Join a remote directory and entry name with a single slash.
pub(crate) fn remote_join(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "/" {
        format!("/{name}")
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

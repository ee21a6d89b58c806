//! User-facing handle onto the manager.
//!
//! A handle owns a connection to at most one channel and queues jobs on
//! it. Everything is fire-and-forget: job methods return a [`JobId`] and
//! the result arrives later as a [`crate::Event::JobFinished`] event.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use matic_core::Result;

use crate::event::FinishedJob;
use crate::job::{
    DownloadDirPlan, DownloadPlan, JobId, ListDirPlan, PollIntervalPlan, PrintFilePlan, QuitPlan,
    RestartPlan, RunPlan, TimeSyncPlan, UploadDirPlan, UploadPlan, WalkPolicy,
};
use crate::manager::{AgentManager, HandleId};

/// A reference to the manager scoped to one logical client.
#[derive(Clone)]
pub struct Handle {
    manager: Arc<AgentManager>,
    id: HandleId,
}

impl Handle {
    pub(crate) fn new(manager: Arc<AgentManager>, id: HandleId) -> Handle {
        Handle { manager, id }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to a channel by identifier: exact channel id, agent-name
    /// substring or object-path substring. With no match yet the connect
    /// stays pending and resolves when a matching agent announces.
    pub fn connect(&self, identifier: &str) -> Result<()> {
        self.manager.connect(self.id, identifier)
    }

    pub fn is_connected(&self) -> Result<bool> {
        self.manager.is_connected(self.id)
    }

    /// Whether the bound channel was lost. A stale handle refuses new jobs.
    pub fn is_stale(&self) -> Result<bool> {
        self.manager.is_stale(self.id)
    }

    /// Id of the bound channel, once connected.
    pub fn channel_id(&self) -> Result<Option<String>> {
        self.manager.channel_id(self.id)
    }

    /// Drop the handle; its queued jobs are cancelled, and the channel is
    /// released when this was its last handle.
    pub fn disconnect(self) -> Result<()> {
        self.manager.disconnect(self.id)
    }

    // =========================================================================
    // File transfer
    // =========================================================================

    pub fn download(&self, remote: &str, local: impl AsRef<Path>) -> Result<JobId> {
        self.manager.queue_job(
            self.id,
            "download",
            Box::new(DownloadPlan::new(remote, local.as_ref())),
        )
    }

    pub fn upload(&self, local: impl AsRef<Path>, remote: &str) -> Result<JobId> {
        self.manager.queue_job(
            self.id,
            "upload",
            Box::new(UploadPlan::new(local.as_ref(), remote)),
        )
    }

    /// Fetch a remote file; its content becomes the job output.
    pub fn print_file(&self, remote: &str) -> Result<JobId> {
        self.manager
            .queue_job(self.id, "print-file", Box::new(PrintFilePlan::new(remote)))
    }

    pub fn list_dir(&self, path: &str) -> Result<JobId> {
        self.manager
            .queue_job(self.id, "list-dir", Box::new(ListDirPlan::new(path)))
    }

    pub fn upload_dir(
        &self,
        local: impl AsRef<Path>,
        remote: &str,
        policy: WalkPolicy,
    ) -> Result<JobId> {
        self.manager.queue_job(
            self.id,
            "upload-dir",
            Box::new(UploadDirPlan::new(local.as_ref(), remote, policy)),
        )
    }

    pub fn download_dir(
        &self,
        remote: &str,
        local: impl AsRef<Path>,
        policy: WalkPolicy,
    ) -> Result<JobId> {
        self.manager.queue_job(
            self.id,
            "download-dir",
            Box::new(DownloadDirPlan::new(remote, local.as_ref(), policy)),
        )
    }

    // =========================================================================
    // Agent control
    // =========================================================================

    /// Run a command on the target; output and exit status arrive with the
    /// finished-job report.
    pub fn run(&self, command: &str) -> Result<JobId> {
        self.manager
            .queue_job(self.id, "run", Box::new(RunPlan::new(command)))
    }

    pub fn set_poll_interval(&self, interval: Duration) -> Result<JobId> {
        self.manager.queue_job(
            self.id,
            "poll-interval",
            Box::new(PollIntervalPlan::new(interval)),
        )
    }

    pub fn time_get(&self) -> Result<JobId> {
        self.manager
            .queue_job(self.id, "time-get", Box::new(TimeSyncPlan::get()))
    }

    pub fn time_set(&self, unix_seconds: u64) -> Result<JobId> {
        self.manager
            .queue_job(self.id, "time-set", Box::new(TimeSyncPlan::set(unix_seconds)))
    }

    /// Ask the agent to exit; the channel retires once acknowledged.
    pub fn quit_agent(&self, code: u32) -> Result<JobId> {
        self.manager
            .queue_job(self.id, "quit", Box::new(QuitPlan::new(code)))
    }

    /// Ask the agent to re-exec itself; it reconnects with a fresh
    /// announce.
    pub fn restart_agent(&self) -> Result<JobId> {
        self.manager
            .queue_job(self.id, "restart", Box::new(RestartPlan))
    }

    // =========================================================================
    // Job lifecycle
    // =========================================================================

    /// Cancel a queued or running job.
    pub fn cancel(&self, job: JobId) -> Result<bool> {
        self.manager.cancel_job(self.id, job)
    }

    /// Collect the report of a finished job.
    pub fn finished_job(&self, job: JobId) -> Result<Option<FinishedJob>> {
        self.manager.finished_job(job)
    }
}

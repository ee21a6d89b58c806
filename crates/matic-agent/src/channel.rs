//! One channel per announced agent: a FIFO of jobs driven by the agent's
//! polling cadence.
//!
//! The agent initiates every exchange. It either polls with an announce
//! request, answered with the next job request or an idle ack carrying the
//! poll interval, or it delivers the reply to the in-flight request, which
//! immediately yields the next request if the job has one. A channel that
//! misses its deadline goes stale; stale is terminal.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use matic_core::constants::{DEFAULT_POLL_INTERVAL, TIMEOUT_MARGIN};
use matic_core::proto::{Buffer, Opcode, ResponseKind, family};
use matic_core::{Error, Result};

use crate::event::FinishedJob;
use crate::job::{Job, JobId};
use crate::manager::HandleId;

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No jobs queued; the agent is answered with idle acks.
    Idle,
    /// Jobs queued, waiting for the agent's next poll.
    Waiting,
    /// A request is in flight.
    Active,
    /// The agent timed out or retired. Terminal.
    Stale,
}

#[derive(Debug)]
struct QueuedJob {
    id: JobId,
    handle: HandleId,
    job: Job,
}

/// Per-agent job queue and exchange state machine.
#[derive(Debug)]
pub struct Channel {
    id: String,
    magic: u64,
    name: String,
    path: String,
    capabilities: Vec<String>,
    state: ChannelState,
    queue: VecDeque<QueuedJob>,
    next_seq: u32,
    in_flight: Option<u32>,
    poll_interval: Duration,
    deadline: Option<Instant>,
    swap: bool,
    max_len: usize,
    finished: Vec<FinishedJob>,
    stale_reason: Option<String>,
}

impl Channel {
    /// Register a channel for an announced agent.
    ///
    /// `id` is the user-facing channel identifier (agent name plus
    /// ordinal); `magic` carries the identity in its low 32 bits. `swap`
    /// and `max_len` mirror the transport the agent announced on.
    pub fn new(
        id: impl Into<String>,
        magic: u64,
        name: impl Into<String>,
        path: impl Into<String>,
        capabilities: Vec<String>,
        swap: bool,
        max_len: usize,
    ) -> Channel {
        Channel {
            id: id.into(),
            magic,
            name: name.into(),
            path: path.into(),
            capabilities,
            state: ChannelState::Idle,
            queue: VecDeque::new(),
            next_seq: 1,
            in_flight: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            deadline: None,
            swap,
            max_len,
            finished: Vec::new(),
            stale_reason: None,
        }
    }

    // =========================================================================
    // Message handling
    // =========================================================================

    /// Process one inbound buffer and produce the outbound reply, if any.
    ///
    /// Announce requests are polls: the answer is the next job request or
    /// an idle ack. Anything else must be the reply to the in-flight
    /// request; consuming it may immediately yield the next request.
    pub fn handle_message(&mut self, buf: &mut Buffer, now: Instant) -> Result<Option<Buffer>> {
        if self.state == ChannelState::Stale {
            return Err(Error::channel(format!("channel {} is retired", self.id)));
        }
        self.arm_deadline(now);

        let opcode = buf.opcode();
        if opcode.family() == family::ANNOUNCE && opcode.is_request() {
            let poll_seq = buf.sequence();
            return self.pump(Some(poll_seq));
        }

        let Some(expected) = self.in_flight.take() else {
            return Err(Error::channel(format!(
                "unsolicited reply {opcode} on channel {}",
                self.id
            )));
        };
        if buf.sequence() != expected {
            return Err(Error::protocol(format!(
                "reply sequence {} does not match request {} on channel {}",
                buf.sequence(),
                expected,
                self.id
            )));
        }
        let Some(front) = self.queue.front_mut() else {
            return Err(Error::channel(format!(
                "reply with no job on channel {}",
                self.id
            )));
        };
        front.job.next_response(buf)?;
        self.pump(None)
    }

    /// Emit the next outbound buffer: the front job's next request, or, when
    /// the queue drains and the agent polled, an idle ack.
    fn pump(&mut self, poll_seq: Option<u32>) -> Result<Option<Buffer>> {
        while let Some(front) = self.queue.front_mut() {
            let seq = self.next_seq;
            let mut out = Buffer::new(self.magic, Opcode::new(0), seq, self.swap, self.max_len);
            match front.job.next_request(&mut out) {
                Ok(true) => {
                    self.next_seq = self.next_seq.wrapping_add(1);
                    self.in_flight = Some(seq);
                    self.state = ChannelState::Active;
                    return Ok(Some(out));
                }
                Ok(false) => self.finish_front(),
                Err(e) => {
                    warn!(channel = %self.id, error = %e, "job sequencing fault");
                    front.job.record_failure(0, e.to_string());
                    self.finish_front();
                }
            }
            if self.state == ChannelState::Stale {
                return Ok(None);
            }
        }
        self.state = ChannelState::Idle;
        Ok(poll_seq.map(|seq| self.idle_ack(seq)))
    }

    /// Announce-ok reply carrying the poll interval in milliseconds.
    fn idle_ack(&self, seq: u32) -> Buffer {
        let mut buf = Buffer::new(
            self.magic,
            Opcode::request(family::ANNOUNCE).response(ResponseKind::Ok),
            seq,
            self.swap,
            self.max_len,
        );
        // Fits: the payload is a single u32 well under any sane buffer size.
        let _ = buf.write_u32(self.poll_interval.as_millis() as u32);
        buf
    }

    /// Acknowledge the announce that created this channel.
    pub fn announce_ack(&mut self, seq: u32, now: Instant) -> Buffer {
        self.arm_deadline(now);
        self.idle_ack(seq)
    }

    fn finish_front(&mut self) {
        let Some(mut qj) = self.queue.pop_front() else {
            return;
        };
        let clean = qj.job.error().is_none() && !qj.job.is_cancelled();
        if clean {
            if let Some(interval) = qj.job.poll_interval_update() {
                debug!(channel = %self.id, ?interval, "poll interval updated");
                self.poll_interval = interval;
            }
        }
        let retires = clean && qj.job.retires_channel();
        self.push_report(&mut qj);
        if retires {
            self.retire("agent retired");
        }
    }

    fn push_report(&mut self, qj: &mut QueuedJob) {
        self.finished.push(FinishedJob {
            job: qj.id,
            handle: qj.handle,
            name: qj.job.name().to_string(),
            summary: qj.job.summary(),
            output: qj.job.output().to_string(),
            error: qj.job.error().map(|(e, m)| (e, m.to_string())),
            cancelled: qj.job.is_cancelled(),
        });
    }

    // =========================================================================
    // Queue management
    // =========================================================================

    /// Append a job to the FIFO. It goes out when the agent next polls.
    pub fn push_job(&mut self, id: JobId, handle: HandleId, job: Job) -> Result<()> {
        if self.state == ChannelState::Stale {
            return Err(Error::channel(format!("channel {} is stale", self.id)));
        }
        debug!(channel = %self.id, %id, job = job.name(), "job queued");
        self.queue.push_back(QueuedJob { id, handle, job });
        if self.state == ChannelState::Idle {
            self.state = ChannelState::Waiting;
        }
        Ok(())
    }

    /// Cancel a queued or running job.
    ///
    /// The head job with a request in flight winds down at the next
    /// exchange boundary; any other job is removed immediately. Returns
    /// false when the job is not on this channel.
    pub fn cancel_job(&mut self, id: JobId) -> bool {
        let Some(pos) = self.queue.iter().position(|qj| qj.id == id) else {
            return false;
        };
        if pos == 0 && self.in_flight.is_some() {
            self.queue[0].job.cancel();
            return true;
        }
        if let Some(mut qj) = self.queue.remove(pos) {
            qj.job.cancel();
            self.push_report(&mut qj);
        }
        true
    }

    /// Cancel every job queued by a handle. Used when the handle
    /// disconnects.
    pub fn cancel_handle_jobs(&mut self, handle: HandleId) {
        let ids: Vec<JobId> = self
            .queue
            .iter()
            .filter(|qj| qj.handle == handle)
            .map(|qj| qj.id)
            .collect();
        for id in ids {
            self.cancel_job(id);
        }
    }

    /// Drain finished-job reports accumulated since the last call.
    pub fn take_finished(&mut self) -> Vec<FinishedJob> {
        std::mem::take(&mut self.finished)
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    fn arm_deadline(&mut self, now: Instant) {
        self.deadline = Some(now + self.poll_interval + TIMEOUT_MARGIN);
    }

    /// Declare the channel stale when its deadline has passed. Queued jobs
    /// are cancelled; their reports carry the reason.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        if self.state == ChannelState::Stale {
            return false;
        }
        match self.deadline {
            Some(deadline) if now >= deadline => {
                info!(channel = %self.id, "agent missed its poll deadline");
                self.retire("agent timed out");
                true
            }
            _ => false,
        }
    }

    /// Terminal transition: cancel all queued jobs and refuse further work.
    pub fn retire(&mut self, reason: &str) {
        if self.state == ChannelState::Stale {
            return;
        }
        self.state = ChannelState::Stale;
        self.stale_reason = Some(reason.to_string());
        self.deadline = None;
        self.in_flight = None;
        while let Some(mut qj) = self.queue.pop_front() {
            qj.job.cancel();
            self.push_report(&mut qj);
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn magic(&self) -> u64 {
        self.magic
    }

    /// Channel identity: low 32 bits of the magic.
    pub fn identity(&self) -> u32 {
        self.magic as u32
    }

    /// Agent name from the announce.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Object path the channel is registered under.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_stale(&self) -> bool {
        self.state == ChannelState::Stale
    }

    pub fn stale_reason(&self) -> Option<&str> {
        self.stale_reason.as_deref()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

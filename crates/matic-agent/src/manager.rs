//! The agent manager: registry of channels keyed by identity, pending
//! connects, and the event queue handles drain.
//!
//! All state sits behind one mutex; no method blocks waiting for an agent.
//! Transport glue calls [`AgentManager::dispatch`] with each inbound buffer
//! and [`AgentManager::tick`] on a timer; everything else reacts through
//! the drained events.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::{debug, info, warn};

use matic_core::constants::IDENTITY_STRIDE;
use matic_core::proto::{Buffer, family};
use matic_core::{Error, Pipe, Result};

use crate::channel::Channel;
use crate::event::{Event, FinishedJob};
use crate::handle::Handle;
use crate::job::{Job, JobId, JobPlan};

/// Identifier of an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle{}", self.0)
    }
}

#[derive(Debug, Default)]
struct HandleEntry {
    /// Identity of the bound channel, once connected.
    channel: Option<u32>,
    /// Identifier of a connect still waiting for a matching announce.
    pending_connect: Option<String>,
    /// Set when the bound channel was lost.
    stale: bool,
}

struct ManagerInner {
    channels: HashMap<u32, Channel>,
    handles: HashMap<HandleId, HandleEntry>,
    /// Next ordinal per agent name, for channel ids like `hostname0`.
    name_ordinals: HashMap<String, u32>,
    identity_counter: u32,
    next_handle: u64,
    next_job: u64,
    events: VecDeque<Event>,
    /// Finished jobs kept until their owner asks for them.
    finished: HashMap<JobId, FinishedJob>,
}

/// Shared registry of agent channels.
pub struct AgentManager {
    inner: Mutex<ManagerInner>,
}

impl Default for AgentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentManager {
    pub fn new() -> AgentManager {
        AgentManager {
            inner: Mutex::new(ManagerInner {
                channels: HashMap::new(),
                handles: HashMap::new(),
                name_ordinals: HashMap::new(),
                identity_counter: rand::random(),
                next_handle: 1,
                next_job: 1,
                events: VecDeque::new(),
                finished: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ManagerInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::manager("manager state poisoned"))
    }

    // =========================================================================
    // Handles
    // =========================================================================

    /// Open a fresh handle onto the manager.
    pub fn open(self: &Arc<Self>) -> Result<Handle> {
        let mut inner = self.lock()?;
        let id = HandleId(inner.next_handle);
        inner.next_handle += 1;
        inner.handles.insert(id, HandleEntry::default());
        Ok(Handle::new(Arc::clone(self), id))
    }

    /// Bind a handle to a channel.
    ///
    /// The identifier is matched in three tiers: exact channel id, then a
    /// substring of the agent name, then a substring of the object path.
    /// With no match the connect stays pending and resolves against a
    /// later announce.
    pub fn connect(&self, handle: HandleId, identifier: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let entry = inner
            .handles
            .get(&handle)
            .ok_or_else(|| Error::manager(format!("unknown {handle}")))?;
        if entry.stale {
            return Err(Error::manager(format!("{handle} is stale")));
        }
        if entry.channel.is_some() {
            return Err(Error::manager(format!("{handle} is already connected")));
        }
        match find_channel(&inner.channels, identifier) {
            Some(identity) => {
                let channel_id = inner.channels[&identity].id().to_string();
                bind(&mut inner, handle, identity, &channel_id);
            }
            None => {
                debug!(%handle, identifier, "connect pending, no matching channel yet");
                if let Some(entry) = inner.handles.get_mut(&handle) {
                    entry.pending_connect = Some(identifier.to_string());
                }
            }
        }
        Ok(())
    }

    /// Whether the handle is bound to a live channel.
    pub fn is_connected(&self, handle: HandleId) -> Result<bool> {
        let inner = self.lock()?;
        Ok(inner
            .handles
            .get(&handle)
            .is_some_and(|e| e.channel.is_some() && !e.stale))
    }

    pub fn is_stale(&self, handle: HandleId) -> Result<bool> {
        let inner = self.lock()?;
        Ok(inner.handles.get(&handle).is_none_or(|e| e.stale))
    }

    /// Channel id the handle is bound to, if any.
    pub fn channel_id(&self, handle: HandleId) -> Result<Option<String>> {
        let inner = self.lock()?;
        Ok(inner
            .handles
            .get(&handle)
            .and_then(|e| e.channel)
            .and_then(|identity| inner.channels.get(&identity))
            .map(|ch| ch.id().to_string()))
    }

    /// Drop a handle. Its queued jobs are cancelled; the channel itself is
    /// dropped when its last handle disconnects.
    pub fn disconnect(&self, handle: HandleId) -> Result<()> {
        let mut inner = self.lock()?;
        let Some(entry) = inner.handles.remove(&handle) else {
            return Ok(());
        };
        if let Some(identity) = entry.channel {
            if let Some(channel) = inner.channels.get_mut(&identity) {
                channel.cancel_handle_jobs(handle);
            }
            let orphaned = !inner.handles.values().any(|e| e.channel == Some(identity));
            if orphaned {
                if let Some(channel) = inner.channels.remove(&identity) {
                    info!(channel = channel.id(), "last handle gone, dropping channel");
                }
            }
        }
        collect(&mut inner);
        Ok(())
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Queue a job on the handle's channel.
    pub fn queue_job(
        &self,
        handle: HandleId,
        name: &str,
        plan: Box<dyn JobPlan>,
    ) -> Result<JobId> {
        let mut inner = self.lock()?;
        let (stale, bound) = {
            let entry = inner
                .handles
                .get(&handle)
                .ok_or_else(|| Error::job(format!("unknown {handle}")))?;
            (entry.stale, entry.channel)
        };
        if stale {
            return Err(Error::job(format!("{handle} is stale")));
        }
        let Some(identity) = bound else {
            return Err(Error::job(format!("{handle} is not connected")));
        };
        let id = JobId(inner.next_job);
        inner.next_job += 1;
        let job = Job::new(name, plan);
        inner
            .channels
            .get_mut(&identity)
            .ok_or_else(|| Error::manager("channel vanished"))?
            .push_job(id, handle, job)?;
        Ok(id)
    }

    /// Cancel a job queued through the given handle. Returns false when the
    /// job is no longer on the channel.
    pub fn cancel_job(&self, handle: HandleId, job: JobId) -> Result<bool> {
        let mut inner = self.lock()?;
        let bound = inner
            .handles
            .get(&handle)
            .and_then(|e| e.channel)
            .ok_or_else(|| Error::job(format!("{handle} is not connected")))?;
        let cancelled = inner
            .channels
            .get_mut(&bound)
            .map(|ch| ch.cancel_job(job))
            .unwrap_or(false);
        collect(&mut inner);
        Ok(cancelled)
    }

    /// Collect the report of a finished job, removing it from the manager.
    pub fn finished_job(&self, job: JobId) -> Result<Option<FinishedJob>> {
        let mut inner = self.lock()?;
        Ok(inner.finished.remove(&job))
    }

    // =========================================================================
    // Transport glue
    // =========================================================================

    /// Reserve a magic number for an agent launched by the host, keyed off
    /// the identity allocator so it cannot collide with a live channel.
    pub fn reserve_magic(&self) -> Result<u64> {
        let mut inner = self.lock()?;
        loop {
            inner.identity_counter = inner.identity_counter.wrapping_add(IDENTITY_STRIDE);
            let identity = inner.identity_counter;
            if identity != 0 && !inner.channels.contains_key(&identity) {
                return Ok(Buffer::compose_magic(identity));
            }
        }
    }

    /// Consume one inbound message from a pipe and write back the reply,
    /// if any. Announces from unknown identities create channels; anything
    /// else is routed to the owning channel.
    pub fn dispatch(&self, pipe: &mut dyn Pipe, now: Instant) -> Result<()> {
        let raw = pipe.read_data_copy();
        if raw.is_empty() {
            return Ok(());
        }
        let swap = pipe.is_byte_swap_needed();
        let mut buf = Buffer::parse(&raw, swap, pipe.read_buffer_size())?;
        let identity = buf.identity();
        let opcode = buf.opcode();
        let announce = opcode.family() == family::ANNOUNCE && opcode.is_request();

        let mut inner = self.lock()?;

        let known_live = inner
            .channels
            .get(&identity)
            .is_some_and(|ch| !ch.is_stale());
        if announce && !known_live {
            accept_announce(&mut inner, &mut buf, pipe, now)?;
            collect(&mut inner);
            return Ok(());
        }
        if announce && buf.remaining() > 0 {
            // A named announce on a live identity is a second agent
            // colliding with it, not a poll.
            let name = buf.read_str()?;
            let channel = &inner.channels[&identity];
            if name != channel.name() {
                return Err(Error::channel(format!(
                    "duplicate connection: identity {identity:#010x} already bound to {}",
                    channel.id()
                )));
            }
        }

        let channel = inner
            .channels
            .get_mut(&identity)
            .ok_or_else(|| Error::manager(format!("unknown magic {:#018x}", buf.magic())))?;
        match channel.handle_message(&mut buf, now) {
            Ok(Some(out)) => out.commit(pipe)?,
            Ok(None) => {}
            Err(e) => {
                warn!(channel = channel.id(), error = %e, "protocol violation, retiring channel");
                channel.retire("protocol violation");
                collect(&mut inner);
                return Err(e);
            }
        }
        collect(&mut inner);
        Ok(())
    }

    /// Run deadline checks; stale channels surface as lost.
    pub fn tick(&self, now: Instant) -> Result<()> {
        let mut inner = self.lock()?;
        for channel in inner.channels.values_mut() {
            channel.check_timeout(now);
        }
        collect(&mut inner);
        Ok(())
    }

    /// Drain queued events.
    pub fn take_events(&self) -> Result<Vec<Event>> {
        let mut inner = self.lock()?;
        Ok(inner.events.drain(..).collect())
    }

    /// Ids of the currently registered channels.
    pub fn channel_ids(&self) -> Result<Vec<String>> {
        let inner = self.lock()?;
        let mut ids: Vec<String> = inner.channels.values().map(|ch| ch.id().to_string()).collect();
        ids.sort();
        Ok(ids)
    }
}

/// Register a channel for a newly announced agent and ack it.
fn accept_announce(
    inner: &mut ManagerInner,
    buf: &mut Buffer,
    pipe: &mut dyn Pipe,
    now: Instant,
) -> Result<()> {
    let identity = buf.identity();
    // A stale channel under the same identity is a restarted agent.
    if let Some(old) = inner.channels.remove(&identity) {
        debug!(channel = old.id(), "replacing stale channel on re-announce");
    }
    let name = buf.read_str()?;
    let mut capabilities = Vec::new();
    while buf.remaining() > 0 {
        capabilities.push(buf.read_str()?);
    }
    let ordinal = {
        let slot = inner.name_ordinals.entry(name.clone()).or_insert(0);
        let ordinal = *slot;
        *slot += 1;
        ordinal
    };
    let id = format!("{name}{ordinal}");
    let path = format!("matic.agent_manager.{id}");
    info!(channel = %id, identity = format_args!("{identity:#010x}"), ?capabilities, "agent announced");
    let mut channel = Channel::new(
        &id,
        buf.magic(),
        name,
        path,
        capabilities,
        pipe.is_byte_swap_needed(),
        pipe.write_buffer_size(),
    );
    let ack = channel.announce_ack(buf.sequence(), now);
    ack.commit(pipe)?;
    inner.channels.insert(identity, channel);
    resolve_pending(inner);
    Ok(())
}

/// Three-tier channel lookup: exact id, agent-name substring, object-path
/// substring. Stale channels never match.
fn find_channel(channels: &HashMap<u32, Channel>, identifier: &str) -> Option<u32> {
    let live = || channels.values().filter(|ch| !ch.is_stale());
    if let Some(ch) = live().find(|ch| ch.id() == identifier) {
        return Some(ch.identity());
    }
    if let Some(ch) = live().find(|ch| ch.name().contains(identifier)) {
        return Some(ch.identity());
    }
    live()
        .find(|ch| ch.path().contains(identifier))
        .map(|ch| ch.identity())
}

fn bind(inner: &mut ManagerInner, handle: HandleId, identity: u32, channel_id: &str) {
    if let Some(entry) = inner.handles.get_mut(&handle) {
        entry.channel = Some(identity);
        entry.pending_connect = None;
    }
    info!(%handle, channel = channel_id, "handle connected");
    inner.events.push_back(Event::Connected {
        handle,
        channel_id: channel_id.to_string(),
    });
}

/// Retry pending connects against the current channel set.
fn resolve_pending(inner: &mut ManagerInner) {
    let waiting: Vec<(HandleId, String)> = inner
        .handles
        .iter()
        .filter_map(|(id, e)| e.pending_connect.clone().map(|ident| (*id, ident)))
        .collect();
    for (handle, identifier) in waiting {
        if let Some(identity) = find_channel(&inner.channels, &identifier) {
            let channel_id = inner.channels[&identity].id().to_string();
            bind(inner, handle, identity, &channel_id);
        }
    }
}

/// Sweep finished jobs and lost channels into the event queue.
fn collect(inner: &mut ManagerInner) {
    let mut reports = Vec::new();
    let mut lost = Vec::new();
    for (identity, channel) in inner.channels.iter_mut() {
        reports.extend(channel.take_finished());
        if channel.is_stale() {
            lost.push((
                *identity,
                channel.id().to_string(),
                channel.stale_reason().unwrap_or("unknown").to_string(),
            ));
        }
    }
    for report in reports {
        inner.finished.insert(report.job, report.clone());
        inner.events.push_back(Event::JobFinished(report));
    }
    for (identity, channel_id, reason) in lost {
        inner.channels.remove(&identity);
        for entry in inner.handles.values_mut() {
            if entry.channel == Some(identity) {
                entry.stale = true;
            }
        }
        inner.events.push_back(Event::ChannelLost { channel_id, reason });
    }
}

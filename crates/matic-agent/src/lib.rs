//! matic-agent: host-side machinery for the Matic agent protocol.
//!
//! This crate provides:
//! - Protocol operations, one request/response transaction each
//! - Jobs composing operations into user-visible units of work
//! - Channels serializing jobs onto one agent connection
//! - The manager registry and user-facing handles

pub mod channel;
pub mod event;
pub mod handle;
pub mod job;
pub mod manager;
pub mod ops;

pub use channel::{Channel, ChannelState};
pub use event::{Event, FinishedJob};
pub use handle::Handle;
pub use job::{Job, JobId, WalkPolicy};
pub use manager::{AgentManager, HandleId};

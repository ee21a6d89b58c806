//! Test helpers for the Matic workspace.
//!
//! Provides in-memory stand-ins for the pieces that normally come from the
//! host environment: a [`MockPipe`] implementing the transport trait and a
//! [`FakeAgent`] that answers protocol requests from a scripted in-memory
//! filesystem.

pub mod fake_agent;
pub mod mock_pipe;

pub use fake_agent::FakeAgent;
pub use mock_pipe::MockPipe;

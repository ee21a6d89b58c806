//! matic-core: Shared library for the Matic agent protocol.
//!
//! This crate provides:
//! - The 16-byte-header wire buffer codec with negotiated byte order
//! - Opcode families and response kinds
//! - The byte-oriented `Pipe` transport contract
//! - Error taxonomy and logging setup

pub mod constants;
pub mod error;
pub mod logging;
pub mod pipe;
pub mod proto;

pub use error::{Error, Result};
pub use logging::{LogFormat, init_logging};
pub use pipe::Pipe;
pub use proto::{Buffer, Opcode, ResponseKind};

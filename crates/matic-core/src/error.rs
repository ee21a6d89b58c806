//! Error types for matic-core and the agent machinery built on it.

use thiserror::Error;

/// Main error type for Matic operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or out-of-range wire data.
    #[error("buffer error: {message}")]
    Buffer { message: String },

    /// Violation of the request/response contract.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Reply opcode does not pair with the outstanding request.
    #[error("unexpected reply {reply:#06x} to request {request:#06x}")]
    UnexpectedReply { request: u16, reply: u16 },

    /// Normal-completion signal from a data source, not a fault.
    #[error("end of data")]
    EndOfData,

    /// Agent-channel invariant violation.
    #[error("channel error: {message}")]
    Channel { message: String },

    /// Job-level sequencing violation.
    #[error("job error: {message}")]
    Job { message: String },

    /// Registry invariant violation.
    #[error("manager error: {message}")]
    Manager { message: String },
}

impl Error {
    /// Construct a buffer error.
    pub fn buffer(message: impl Into<String>) -> Self {
        Error::Buffer {
            message: message.into(),
        }
    }

    /// Construct a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Construct a channel error.
    pub fn channel(message: impl Into<String>) -> Self {
        Error::Channel {
            message: message.into(),
        }
    }

    /// Construct a job error.
    pub fn job(message: impl Into<String>) -> Self {
        Error::Job {
            message: message.into(),
        }
    }

    /// Construct a manager error.
    pub fn manager(message: impl Into<String>) -> Self {
        Error::Manager {
            message: message.into(),
        }
    }

    /// Whether this error is a control-flow signal rather than a fault.
    pub fn is_signal(&self) -> bool {
        matches!(self, Error::EndOfData)
    }
}

/// Result type alias using the Matic error.
pub type Result<T> = std::result::Result<T, Error>;

//! Transport contract standing in for the host "magic pipe".
//!
//! The host simulator owns the physical transport; this trait captures the
//! exact surface the protocol core relies on. Inbound delivery is push
//! based: the embedding host reads a message off its transport and hands the
//! raw bytes to the manager, which routes by the 8-byte magic in the header.

use crate::error::Result;

/// A byte-oriented duplex transport endpoint.
///
/// Blocking, buffering and wakeups are the transport's business; the codec
/// and the channel machinery never wait on a pipe themselves.
pub trait Pipe {
    /// Maximum number of bytes an inbound message may occupy.
    fn read_buffer_size(&self) -> usize;

    /// Maximum number of bytes an outbound message may occupy.
    fn write_buffer_size(&self) -> usize;

    /// Consume the current inbound message, copying it out of the
    /// transport. Returns an empty vector when nothing is pending.
    fn read_data_copy(&mut self) -> Vec<u8>;

    /// Copy an outbound message into the transport's write location.
    fn write_data_copy(&mut self, data: &[u8]) -> Result<()>;

    /// Whether multi-byte integers on this pipe need swapping relative to
    /// host order. Negotiated once per connection, applied per buffer.
    fn is_byte_swap_needed(&self) -> bool;
}

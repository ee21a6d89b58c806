//! Protocol and configuration constants for Matic.

use std::time::Duration;

// =============================================================================
// Protocol Constants
// =============================================================================

/// Protocol signature carried in the high 32 bits of every magic number.
/// Encodes the protocol major version; a buffer with any other signature
/// is rejected at parse time.
pub const MAGIC_SIGNATURE: u32 = 0x1b90_f02e;

/// Wire header length: magic(8) + length(2) + opcode(2) + sequence(4).
pub const HEADER_LEN: usize = 16;

/// Default negotiated buffer size (header + payload) when the transport
/// does not report its own.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Errno an error reply to ticket-read carries to mark end of stream.
/// Matches Linux ENODATA.
pub const ENODATA_ERRNO: u32 = 61;

/// Maximum payload requested per ticket-read exchange.
pub const READ_CHUNK: u16 = 1024;

// =============================================================================
// Timing Constants
// =============================================================================

/// Default agent poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10_000);

/// Slack added on top of the poll interval before a channel is
/// declared stale.
pub const TIMEOUT_MARGIN: Duration = Duration::from_millis(5_000);

// =============================================================================
// Identity Allocation
// =============================================================================

/// Odd stride used to perturb the channel-identity counter between
/// allocations. Oddness keeps the walk a full cycle of the 32-bit space.
pub const IDENTITY_STRIDE: u32 = 0x9e37_79b9;

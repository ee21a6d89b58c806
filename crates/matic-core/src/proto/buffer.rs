//! Wire buffer codec for Matic messages.
//!
//! Format: 16-byte header (8-byte magic, 2-byte payload length, 2-byte
//! opcode, 4-byte sequence number) followed by the payload. Byte order is
//! negotiated once per buffer from the transport's swap flag and applies to
//! every multi-byte integer in header and payload alike.
//!
//! The codec ensures:
//! - Reads past the valid payload fail instead of returning garbage
//! - Writes that would exceed the negotiated maximum fail up front
//! - A buffer is flushed to the transport exactly once, via `commit`

use bytes::BytesMut;

use crate::constants::{HEADER_LEN, MAGIC_SIGNATURE};
use crate::error::{Error, Result};
use crate::pipe::Pipe;
use crate::proto::Opcode;

/// A single wire message: parsed header plus a payload cursor.
///
/// Owned exclusively by whichever operation is processing it.
#[derive(Debug, Clone)]
pub struct Buffer {
    /// 8-byte magic: protocol signature in the high half, channel
    /// identity in the low half.
    magic: u64,
    /// Message opcode.
    opcode: Opcode,
    /// Per-channel sequence number.
    sequence: u32,
    /// Payload bytes, header excluded.
    payload: BytesMut,
    /// Whether wire integers need swapping relative to host order.
    swap: bool,
    /// Negotiated maximum total message length, header included.
    max_len: usize,
    /// Read cursor into the payload.
    read_pos: usize,
}

impl Buffer {
    /// Compose a magic number from the protocol signature and a channel
    /// identity.
    pub fn compose_magic(identity: u32) -> u64 {
        ((MAGIC_SIGNATURE as u64) << 32) | identity as u64
    }

    /// Start a fresh outbound message.
    pub fn new(magic: u64, opcode: Opcode, sequence: u32, swap: bool, max_len: usize) -> Self {
        Buffer {
            magic,
            opcode,
            sequence,
            payload: BytesMut::new(),
            swap,
            max_len,
            read_pos: 0,
        }
    }

    /// Parse an inbound message from raw transport bytes.
    ///
    /// The swap flag comes from the transport; `max_len` is its negotiated
    /// buffer size. Rejects short headers, unknown protocol signatures and
    /// headers whose length field overruns the supplied bytes.
    pub fn parse(data: &[u8], swap: bool, max_len: usize) -> Result<Buffer> {
        if data.len() < HEADER_LEN {
            return Err(Error::buffer(format!(
                "message too short for header: {} bytes",
                data.len()
            )));
        }
        if data.len() > max_len {
            return Err(Error::buffer(format!(
                "message length {} exceeds negotiated maximum {}",
                data.len(),
                max_len
            )));
        }

        let magic = get_uint(&data[0..8], swap);
        let signature = (magic >> 32) as u32;
        if signature != MAGIC_SIGNATURE {
            return Err(Error::buffer(format!(
                "unrecognized protocol version: signature {signature:#010x}"
            )));
        }

        let length = get_uint(&data[8..10], swap) as usize;
        let opcode = Opcode::new(get_uint(&data[10..12], swap) as u16);
        let sequence = get_uint(&data[12..16], swap) as u32;

        if HEADER_LEN + length > data.len() {
            return Err(Error::buffer(format!(
                "payload length {} overruns message of {} bytes",
                length,
                data.len()
            )));
        }

        Ok(Buffer {
            magic,
            opcode,
            sequence,
            payload: BytesMut::from(&data[HEADER_LEN..HEADER_LEN + length]),
            swap,
            max_len,
            read_pos: 0,
        })
    }

    /// Full magic number.
    pub fn magic(&self) -> u64 {
        self.magic
    }

    /// Channel identity: the low 32 bits of the magic.
    pub fn identity(&self) -> u32 {
        self.magic as u32
    }

    /// Message opcode.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Replace the opcode on an outgoing buffer.
    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.opcode = opcode;
    }

    /// Sequence number.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Replace the sequence number on an outgoing buffer.
    pub fn set_sequence(&mut self, sequence: u32) {
        self.sequence = sequence;
    }

    /// Current payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Number of unread payload bytes.
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.read_pos
    }

    /// Reset the read cursor to the start of the payload.
    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }

    // =========================================================================
    // Reads
    // =========================================================================

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.read_pos + n > self.payload.len() {
            return Err(Error::buffer(format!(
                "read of {} bytes at offset {} beyond payload of {}",
                n,
                self.read_pos,
                self.payload.len()
            )));
        }
        let slice = &self.payload[self.read_pos..self.read_pos + n];
        self.read_pos += n;
        Ok(slice)
    }

    /// Read a 16-bit integer in the negotiated order.
    pub fn read_u16(&mut self) -> Result<u16> {
        let swap = self.swap;
        Ok(get_uint(self.take(2)?, swap) as u16)
    }

    /// Read a 32-bit integer in the negotiated order.
    pub fn read_u32(&mut self) -> Result<u32> {
        let swap = self.swap;
        Ok(get_uint(self.take(4)?, swap) as u32)
    }

    /// Read a 64-bit integer in the negotiated order.
    pub fn read_u64(&mut self) -> Result<u64> {
        let swap = self.swap;
        Ok(get_uint(self.take(8)?, swap))
    }

    /// Read a NUL-terminated UTF-8 string, consuming the terminator.
    pub fn read_str(&mut self) -> Result<String> {
        let rest = &self.payload[self.read_pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::buffer("unterminated string in payload"))?;
        let text = std::str::from_utf8(&rest[..nul])
            .map_err(|e| Error::buffer(format!("invalid UTF-8 in string: {e}")))?
            .to_owned();
        self.read_pos += nul + 1;
        Ok(text)
    }

    /// Read a raw binary blob of `n` bytes.
    pub fn read_blob(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    /// Read all remaining payload bytes.
    pub fn read_rest(&mut self) -> Vec<u8> {
        let rest = self.payload[self.read_pos..].to_vec();
        self.read_pos = self.payload.len();
        rest
    }

    // =========================================================================
    // Writes
    // =========================================================================

    fn reserve(&mut self, n: usize) -> Result<()> {
        if HEADER_LEN + self.payload.len() + n > self.max_len {
            return Err(Error::buffer(format!(
                "write of {} bytes exceeds negotiated maximum of {} (payload {})",
                n,
                self.max_len,
                self.payload.len()
            )));
        }
        Ok(())
    }

    /// Append a 16-bit integer in the negotiated order.
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.reserve(2)?;
        put_uint(&mut self.payload, value as u64, 2, self.swap);
        Ok(())
    }

    /// Append a 32-bit integer in the negotiated order.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.reserve(4)?;
        put_uint(&mut self.payload, value as u64, 4, self.swap);
        Ok(())
    }

    /// Append a 64-bit integer in the negotiated order.
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.reserve(8)?;
        put_uint(&mut self.payload, value, 8, self.swap);
        Ok(())
    }

    /// Append a string with its NUL terminator.
    pub fn write_str(&mut self, value: &str) -> Result<()> {
        if value.as_bytes().contains(&0) {
            return Err(Error::buffer("embedded NUL in string"));
        }
        self.reserve(value.len() + 1)?;
        self.payload.extend_from_slice(value.as_bytes());
        self.payload.extend_from_slice(&[0]);
        Ok(())
    }

    /// Append a raw binary blob.
    pub fn write_blob(&mut self, value: &[u8]) -> Result<()> {
        self.reserve(value.len())?;
        self.payload.extend_from_slice(value);
        Ok(())
    }

    /// Spare payload capacity before the negotiated maximum is hit.
    pub fn capacity_left(&self) -> usize {
        self.max_len.saturating_sub(HEADER_LEN + self.payload.len())
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// Serialize header and payload into wire bytes.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        put_uint(&mut out, self.magic, 8, self.swap);
        put_uint(&mut out, self.payload.len() as u64, 2, self.swap);
        put_uint(&mut out, self.opcode.raw() as u64, 2, self.swap);
        put_uint(&mut out, self.sequence as u64, 4, self.swap);
        out.extend_from_slice(&self.payload);
        out.to_vec()
    }

    /// Flush this buffer to the transport. Called exactly once per request
    /// or reply; the transport owns any blocking.
    pub fn commit(&self, pipe: &mut dyn Pipe) -> Result<()> {
        let wire = self.to_wire();
        if wire.len() > pipe.write_buffer_size() {
            return Err(Error::buffer(format!(
                "message of {} bytes exceeds pipe write buffer of {}",
                wire.len(),
                pipe.write_buffer_size()
            )));
        }
        pipe.write_data_copy(&wire)
    }
}

/// Decode an unsigned integer of `bytes.len()` bytes in the negotiated order.
fn get_uint(bytes: &[u8], swap: bool) -> u64 {
    let mut value: u64 = 0;
    if swap {
        for &b in bytes {
            value = (value << 8) | b as u64;
        }
    } else {
        for &b in bytes.iter().rev() {
            value = (value << 8) | b as u64;
        }
    }
    value
}

/// Append an unsigned integer of `width` bytes in the negotiated order.
fn put_uint(out: &mut BytesMut, value: u64, width: usize, swap: bool) {
    let le = value.to_le_bytes();
    if swap {
        out.extend(le[..width].iter().rev());
    } else {
        out.extend_from_slice(&le[..width]);
    }
}

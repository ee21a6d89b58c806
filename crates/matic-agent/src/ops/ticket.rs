//! Ticket-scoped operations: read, write, discard, position get/set.
//!
//! A ticket is an opaque handle to a server-side resource (open file,
//! directory listing, subprocess). It is valid from the reply that returned
//! it until a discard succeeds.

use matic_core::constants::{ENODATA_ERRNO, READ_CHUNK};
use matic_core::proto::{Buffer, Opcode, ResponseKind, family};
use matic_core::{Error, Result};

use super::{OpCore, OpState, check_reply, decode_error, decode_failure};

/// Opaque agent-side resource handle. Always non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u32);

impl Ticket {
    /// Validate a user- or job-supplied ticket value.
    ///
    /// Zero and negative values are rejected before any request is sent.
    pub fn new(value: i64) -> Result<Ticket> {
        if value <= 0 || value > u32::MAX as i64 {
            return Err(Error::protocol(format!("invalid ticket {value}")));
        }
        Ok(Ticket(value as u32))
    }

    /// Validate a ticket arriving in a reply.
    pub(crate) fn from_wire(raw: u32) -> Result<Ticket> {
        if raw == 0 {
            return Err(Error::protocol("agent returned null ticket"));
        }
        Ok(Ticket(raw))
    }

    /// Raw wire value.
    pub fn value(self) -> u32 {
        self.0
    }
}

/// Read from a ticket until the agent reports end of stream.
///
/// A multi-part exchange: each request asks for up to [`READ_CHUNK`] bytes;
/// an error reply carrying ENODATA is the normal end of stream, any other
/// errno is a failure.
#[derive(Debug)]
pub struct ReadOp {
    core: OpCore,
    ticket: Ticket,
    data: Vec<u8>,
    eof: bool,
}

impl ReadOp {
    /// Construct a read over a ticket. Rejects non-positive tickets
    /// immediately, before any request goes out.
    pub fn new(ticket: i64) -> Result<ReadOp> {
        Ok(ReadOp {
            core: OpCore::new(family::TICKET_READ),
            ticket: Ticket::new(ticket)?,
            data: Vec::new(),
            eof: false,
        })
    }

    /// Construct from a ticket already validated by a reply.
    pub fn from_ticket(ticket: Ticket) -> ReadOp {
        ReadOp {
            core: OpCore::new(family::TICKET_READ),
            ticket,
            data: Vec::new(),
            eof: false,
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.started()?;
        buf.write_u32(self.ticket.value())?;
        buf.write_u16(READ_CHUNK)
    }

    pub fn parse_reply(&mut self, buf: &mut Buffer) -> Result<()> {
        match check_reply(self.core.opcode(), buf)? {
            ResponseKind::Data => {
                let chunk = buf.read_rest();
                if chunk.is_empty() {
                    // Zero-length data doubles as end of stream.
                    self.eof = true;
                    self.core.complete();
                } else {
                    self.data.extend_from_slice(&chunk);
                    self.core.set_state(OpState::Active);
                }
                Ok(())
            }
            ResponseKind::Error => {
                let (errno, message) = decode_error(buf)?;
                if errno == ENODATA_ERRNO {
                    // Normal end of stream, not a failure.
                    self.eof = true;
                    self.core.complete();
                } else {
                    self.core.fail(errno, message);
                }
                Ok(())
            }
            ResponseKind::Failure => Err(decode_failure(self.core.opcode(), buf)),
            _ => Err(Error::UnexpectedReply {
                request: self.core.opcode().raw(),
                reply: buf.opcode().raw(),
            }),
        }
    }

    /// Whether the agent has reported end of stream.
    pub fn at_eof(&self) -> bool {
        self.eof
    }

    /// Drain the bytes accumulated so far.
    pub fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn state(&self) -> OpState {
        self.core.state()
    }

    pub fn opcode(&self) -> Opcode {
        self.core.opcode()
    }

    pub fn error(&self) -> Option<(u32, &str)> {
        self.core.error()
    }

    pub fn failed(&self) -> bool {
        self.state() == OpState::Failed
    }
}

/// Write a byte sequence to a ticket, one chunk per exchange.
///
/// Once the source is exhausted, the next request attempt returns
/// `Error::EndOfData` with the operation already marked done; the job layer
/// treats that as the completion trigger.
#[derive(Debug)]
pub struct WriteOp {
    core: OpCore,
    ticket: Ticket,
    data: Vec<u8>,
    offset: usize,
}

impl WriteOp {
    pub fn new(ticket: Ticket, data: Vec<u8>) -> WriteOp {
        WriteOp {
            core: OpCore::new(family::TICKET_WRITE),
            ticket,
            data,
            offset: 0,
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        if self.offset >= self.data.len() {
            self.core.complete();
            return Err(Error::EndOfData);
        }
        self.core.started()?;
        buf.write_u32(self.ticket.value())?;
        let chunk = self.data.len().min(self.offset + buf.capacity_left());
        buf.write_blob(&self.data[self.offset..chunk])?;
        self.offset = chunk;
        Ok(())
    }

    pub fn parse_reply(&mut self, buf: &mut Buffer) -> Result<()> {
        match check_reply(self.core.opcode(), buf)? {
            ResponseKind::Ok => {
                // More chunks may remain; completion comes from EndOfData.
                self.core.set_state(OpState::Active);
                Ok(())
            }
            ResponseKind::Error => {
                let (errno, message) = decode_error(buf)?;
                self.core.fail(errno, message);
                Ok(())
            }
            ResponseKind::Failure => Err(decode_failure(self.core.opcode(), buf)),
            _ => Err(Error::UnexpectedReply {
                request: self.core.opcode().raw(),
                reply: buf.opcode().raw(),
            }),
        }
    }

    /// Bytes handed to the transport so far.
    pub fn written(&self) -> usize {
        self.offset
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn state(&self) -> OpState {
        self.core.state()
    }

    pub fn opcode(&self) -> Opcode {
        self.core.opcode()
    }

    pub fn error(&self) -> Option<(u32, &str)> {
        self.core.error()
    }

    pub fn failed(&self) -> bool {
        self.state() == OpState::Failed
    }
}

/// Release a ticket. For subprocess tickets the ok reply carries the exit
/// status.
#[derive(Debug)]
pub struct DiscardOp {
    core: OpCore,
    ticket: Ticket,
    exit_status: Option<i32>,
}

impl DiscardOp {
    pub fn new(ticket: Ticket) -> DiscardOp {
        DiscardOp {
            core: OpCore::new(family::TICKET_DISCARD),
            ticket,
            exit_status: None,
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.started()?;
        buf.write_u32(self.ticket.value())
    }

    pub fn parse_reply(&mut self, buf: &mut Buffer) -> Result<()> {
        match check_reply(self.core.opcode(), buf)? {
            ResponseKind::Ok => {
                if buf.remaining() >= 4 {
                    self.exit_status = Some(buf.read_u32()? as i32);
                }
                self.core.complete();
                Ok(())
            }
            ResponseKind::Error => {
                let (errno, message) = decode_error(buf)?;
                self.core.fail(errno, message);
                Ok(())
            }
            ResponseKind::Failure => Err(decode_failure(self.core.opcode(), buf)),
            _ => Err(Error::UnexpectedReply {
                request: self.core.opcode().raw(),
                reply: buf.opcode().raw(),
            }),
        }
    }

    /// Exit status for subprocess tickets, once done.
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    pub fn state(&self) -> OpState {
        self.core.state()
    }

    pub fn opcode(&self) -> Opcode {
        self.core.opcode()
    }

    pub fn error(&self) -> Option<(u32, &str)> {
        self.core.error()
    }

    pub fn failed(&self) -> bool {
        self.state() == OpState::Failed
    }
}

/// Query the stream position of a ticket.
#[derive(Debug)]
pub struct GetPosOp {
    core: OpCore,
    ticket: Ticket,
    pos: Option<u64>,
}

impl GetPosOp {
    pub fn new(ticket: Ticket) -> GetPosOp {
        GetPosOp {
            core: OpCore::new(family::TICKET_GETPOS),
            ticket,
            pos: None,
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.started()?;
        buf.write_u32(self.ticket.value())
    }

    pub fn parse_reply(&mut self, buf: &mut Buffer) -> Result<()> {
        match check_reply(self.core.opcode(), buf)? {
            ResponseKind::Data => {
                self.pos = Some(buf.read_u64()?);
                self.core.complete();
                Ok(())
            }
            ResponseKind::Error => {
                let (errno, message) = decode_error(buf)?;
                self.core.fail(errno, message);
                Ok(())
            }
            ResponseKind::Failure => Err(decode_failure(self.core.opcode(), buf)),
            _ => Err(Error::UnexpectedReply {
                request: self.core.opcode().raw(),
                reply: buf.opcode().raw(),
            }),
        }
    }

    pub fn pos(&self) -> Option<u64> {
        self.pos
    }

    pub fn state(&self) -> OpState {
        self.core.state()
    }

    pub fn opcode(&self) -> Opcode {
        self.core.opcode()
    }

    pub fn error(&self) -> Option<(u32, &str)> {
        self.core.error()
    }

    pub fn failed(&self) -> bool {
        self.state() == OpState::Failed
    }
}

/// Set the stream position of a ticket.
#[derive(Debug)]
pub struct SetPosOp {
    core: OpCore,
    ticket: Ticket,
    pos: u64,
}

impl SetPosOp {
    pub fn new(ticket: Ticket, pos: u64) -> SetPosOp {
        SetPosOp {
            core: OpCore::new(family::TICKET_SETPOS),
            ticket,
            pos,
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.started()?;
        buf.write_u32(self.ticket.value())?;
        buf.write_u64(self.pos)
    }

    pub fn parse_reply(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.parse_ok_reply(buf)
    }

    pub fn state(&self) -> OpState {
        self.core.state()
    }

    pub fn opcode(&self) -> Opcode {
        self.core.opcode()
    }

    pub fn error(&self) -> Option<(u32, &str)> {
        self.core.error()
    }

    pub fn failed(&self) -> bool {
        self.state() == OpState::Failed
    }
}

//! Protocol operations: one request/response transaction each.
//!
//! Operations form a closed set, one variant per opcode family in use,
//! sharing a small capability surface: populate an outgoing request, parse
//! the matching reply, expose state. Dispatch is a match on the variant
//! rather than inheritance.

mod control;
mod file;
mod ticket;

pub use control::{ProcOpenOp, QuitOp, RestartOp, SetPollOp, TimeGetOp, TimeSetOp};
pub use file::{
    LinkOp, MakeDirOp, MakeOp, OpenOp, PermOp, ReadDirOp, RemoveOp, StatInfo, StatKind, StatOp,
    open_flags,
};
pub use ticket::{DiscardOp, GetPosOp, ReadOp, SetPosOp, Ticket, WriteOp};

use matic_core::proto::{Buffer, Opcode, ResponseKind};
use matic_core::{Error, Result};

/// Lifecycle of a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    /// Constructed, no request sent yet.
    Ready,
    /// First request sent, awaiting the reply.
    Started,
    /// Mid multi-part exchange.
    Active,
    /// Terminal success.
    Done,
    /// Terminal error.
    Failed,
}

impl OpState {
    /// Whether the operation has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, OpState::Done | OpState::Failed)
    }
}

/// The closed set of protocol operations.
#[derive(Debug)]
pub enum Op {
    Open(OpenOp),
    Stat(StatOp),
    Link(LinkOp),
    Make(MakeOp),
    Remove(RemoveOp),
    Perm(PermOp),
    MakeDir(MakeDirOp),
    ReadDir(ReadDirOp),
    Read(ReadOp),
    Write(WriteOp),
    Discard(DiscardOp),
    GetPos(GetPosOp),
    SetPos(SetPosOp),
    TimeGet(TimeGetOp),
    TimeSet(TimeSetOp),
    SetPoll(SetPollOp),
    ProcOpen(ProcOpenOp),
    Quit(QuitOp),
    Restart(RestartOp),
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            Op::Open($inner) => $body,
            Op::Stat($inner) => $body,
            Op::Link($inner) => $body,
            Op::Make($inner) => $body,
            Op::Remove($inner) => $body,
            Op::Perm($inner) => $body,
            Op::MakeDir($inner) => $body,
            Op::ReadDir($inner) => $body,
            Op::Read($inner) => $body,
            Op::Write($inner) => $body,
            Op::Discard($inner) => $body,
            Op::GetPos($inner) => $body,
            Op::SetPos($inner) => $body,
            Op::TimeGet($inner) => $body,
            Op::TimeSet($inner) => $body,
            Op::SetPoll($inner) => $body,
            Op::ProcOpen($inner) => $body,
            Op::Quit($inner) => $body,
            Op::Restart($inner) => $body,
        }
    };
}

impl Op {
    /// Populate the outgoing request for this operation.
    ///
    /// Write-style operations return `Error::EndOfData` once their data
    /// source is exhausted; the job layer treats that as completion, not a
    /// fault.
    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        delegate!(self, op => op.send_request(buf))
    }

    /// Interpret the reply to the last request.
    ///
    /// Violations of the request/response pairing are returned as errors;
    /// errno-style failures reported by the agent are recorded on the
    /// operation (state `Failed`, queryable via [`Op::error`]) so the owning
    /// job's plan can decide whether they are fatal.
    pub fn parse_reply(&mut self, buf: &mut Buffer) -> Result<()> {
        delegate!(self, op => op.parse_reply(buf))
    }

    /// Current operation state.
    pub fn state(&self) -> OpState {
        delegate!(self, op => op.state())
    }

    /// The request-family opcode of this operation.
    pub fn opcode(&self) -> Opcode {
        delegate!(self, op => op.opcode())
    }

    /// Agent-reported error, if the operation failed with one.
    pub fn error(&self) -> Option<(u32, &str)> {
        delegate!(self, op => op.error())
    }

    /// Whether the operation finished, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether the operation failed.
    pub fn failed(&self) -> bool {
        self.state() == OpState::Failed
    }
}

/// State and error bookkeeping shared by every concrete operation.
#[derive(Debug)]
pub(crate) struct OpCore {
    opcode: Opcode,
    state: OpState,
    error: Option<(u32, String)>,
}

impl OpCore {
    pub(crate) fn new(family: u16) -> Self {
        OpCore {
            opcode: Opcode::request(family),
            state: OpState::Ready,
            error: None,
        }
    }

    pub(crate) fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub(crate) fn state(&self) -> OpState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: OpState) {
        self.state = state;
    }

    pub(crate) fn error(&self) -> Option<(u32, &str)> {
        self.error.as_ref().map(|(e, m)| (*e, m.as_str()))
    }

    /// Record the request having gone out.
    pub(crate) fn started(&mut self) -> Result<()> {
        match self.state {
            OpState::Ready => {
                self.state = OpState::Started;
                Ok(())
            }
            OpState::Active => Ok(()),
            other => Err(Error::protocol(format!(
                "request from {} in state {other:?}",
                self.opcode
            ))),
        }
    }

    pub(crate) fn complete(&mut self) {
        self.state = OpState::Done;
    }

    pub(crate) fn fail(&mut self, errno: u32, message: String) {
        self.error = Some((errno, message));
        self.state = OpState::Failed;
    }

    /// Shared reply handling for operations that expect a bare ok.
    pub(crate) fn parse_ok_reply(&mut self, buf: &mut Buffer) -> Result<()> {
        match check_reply(self.opcode, buf)? {
            ResponseKind::Ok => {
                self.complete();
                Ok(())
            }
            ResponseKind::Error => {
                let (errno, message) = decode_error(buf)?;
                self.fail(errno, message);
                Ok(())
            }
            ResponseKind::Failure => Err(decode_failure(self.opcode, buf)),
            _ => Err(Error::UnexpectedReply {
                request: self.opcode.raw(),
                reply: buf.opcode().raw(),
            }),
        }
    }

    /// Shared reply handling for operations that expect a ticket.
    pub(crate) fn parse_ticket_reply(&mut self, buf: &mut Buffer) -> Result<Option<Ticket>> {
        match check_reply(self.opcode, buf)? {
            ResponseKind::Ticket => {
                let raw = buf.read_u32()?;
                let ticket = Ticket::from_wire(raw)?;
                self.complete();
                Ok(Some(ticket))
            }
            ResponseKind::Error => {
                let (errno, message) = decode_error(buf)?;
                self.fail(errno, message);
                Ok(None)
            }
            ResponseKind::Failure => Err(decode_failure(self.opcode, buf)),
            _ => Err(Error::UnexpectedReply {
                request: self.opcode.raw(),
                reply: buf.opcode().raw(),
            }),
        }
    }
}

/// Validate a reply header against the outstanding request opcode.
///
/// Returns the decoded response kind. A reply whose family differs from the
/// request's, whose kind nibble is unrecognized, or whose kind is `Request`
/// (the request echoed back) violates the pairing contract.
pub(crate) fn check_reply(request: Opcode, buf: &Buffer) -> Result<ResponseKind> {
    let reply = buf.opcode();
    if !reply.same_family(request) {
        return Err(Error::UnexpectedReply {
            request: request.raw(),
            reply: reply.raw(),
        });
    }
    match reply.kind() {
        None | Some(ResponseKind::Request) => Err(Error::UnexpectedReply {
            request: request.raw(),
            reply: reply.raw(),
        }),
        Some(kind) => Ok(kind),
    }
}

/// Decode an error reply payload: errno plus message.
pub(crate) fn decode_error(buf: &mut Buffer) -> Result<(u32, String)> {
    let errno = buf.read_u32()?;
    let message = buf.read_str()?;
    Ok((errno, message))
}

/// Decode a failure reply (fatal, message only) into a protocol error.
pub(crate) fn decode_failure(request: Opcode, buf: &mut Buffer) -> Error {
    match buf.read_str() {
        Ok(message) => Error::protocol(format!("agent failure on {request}: {message}")),
        Err(_) => Error::protocol(format!("agent failure on {request}")),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use matic_core::proto::family;

    #[test]
    fn reply_with_request_opcode_is_rejected() {
        let req = Opcode::request(family::FILE_OPEN);
        let buf = testutil::reply(req, ResponseKind::Request, |_| {});
        let err = check_reply(req, &buf).unwrap_err();
        assert!(matches!(err, Error::UnexpectedReply { .. }));
    }

    #[test]
    fn reply_from_other_family_is_rejected() {
        let req = Opcode::request(family::FILE_OPEN);
        let other = Opcode::request(family::FILE_STAT);
        let buf = testutil::reply(other, ResponseKind::Ok, |_| {});
        let err = check_reply(req, &buf).unwrap_err();
        assert!(matches!(err, Error::UnexpectedReply { .. }));
    }

    #[test]
    fn matching_response_kinds_are_accepted() {
        let req = Opcode::request(family::TICKET_READ);
        for kind in [
            ResponseKind::Ok,
            ResponseKind::Data,
            ResponseKind::Ticket,
            ResponseKind::Custom,
            ResponseKind::Error,
            ResponseKind::Failure,
        ] {
            let buf = testutil::reply(req, kind, |_| {});
            assert_eq!(check_reply(req, &buf).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_kind_nibble_is_rejected() {
        let req = Opcode::request(family::TICKET_READ);
        let buf = testutil::reply(req, ResponseKind::Ok, |_| {});
        // Rebuild with a raw unknown nibble.
        let raw = Opcode::new(req.raw() | 0x7);
        let buf2 = Buffer::parse(
            &{
                let mut b = Buffer::new(buf.magic(), raw, 1, false, 4096);
                b.write_u32(0).unwrap();
                b.to_wire()
            },
            false,
            4096,
        )
        .unwrap();
        assert!(check_reply(req, &buf2).is_err());
    }
}

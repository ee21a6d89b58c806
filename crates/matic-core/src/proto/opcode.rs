//! Opcode space: request families and response kinds.
//!
//! A 16-bit opcode splits into a request family (top 12 bits) and a
//! response kind (low 4 bits). A zero low nibble marks a bare request;
//! every response kind is non-zero.

use std::fmt;

/// Request family constants (top 12 bits of the opcode, low nibble zero).
pub mod family {
    pub const ANNOUNCE: u16 = 0x0000;
    pub const SET_POLL_INTERVAL: u16 = 0x0010;
    pub const TIME_GET: u16 = 0x0020;
    pub const FILE_OPEN: u16 = 0x0030;
    pub const FILE_STAT: u16 = 0x0040;
    pub const FILE_LINK: u16 = 0x0050;
    pub const FILE_MAKE: u16 = 0x0060;
    pub const FILE_REMOVE: u16 = 0x00f0;
    pub const TICKET_DISCARD: u16 = 0x0100;
    pub const TICKET_READ: u16 = 0x0110;
    pub const TICKET_WRITE: u16 = 0x0120;
    pub const TICKET_GETPOS: u16 = 0x0150;
    pub const TICKET_SETPOS: u16 = 0x0160;
    pub const TIME_SET: u16 = 0x1000;
    pub const READ_DIR: u16 = 0x1010;
    pub const FILE_PERM: u16 = 0x1020;
    pub const MAKE_DIR: u16 = 0x1030;
    pub const RESTART_AGENT: u16 = 0x17f0;
    pub const PROCESS_OPEN: u16 = 0x1800;
    pub const QUIT_AGENT: u16 = 0xfff0;
}

/// Low-nibble response kind of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    /// Bare request (low nibble zero).
    Request,
    /// Plain acknowledgment.
    Ok,
    /// Reply carrying a data payload.
    Data,
    /// Reply carrying a resource ticket.
    Ticket,
    /// Family-specific reply payload.
    Custom,
    /// Recoverable error: errno plus message.
    Error,
    /// Fatal failure: message only.
    Failure,
}

impl ResponseKind {
    /// Decode a low nibble into a response kind, if recognized.
    pub fn from_nibble(nibble: u16) -> Option<ResponseKind> {
        match nibble {
            0x0 => Some(ResponseKind::Request),
            0x1 => Some(ResponseKind::Ok),
            0x2 => Some(ResponseKind::Data),
            0x3 => Some(ResponseKind::Ticket),
            0x4 => Some(ResponseKind::Custom),
            0xe => Some(ResponseKind::Error),
            0xf => Some(ResponseKind::Failure),
            _ => None,
        }
    }

    /// The nibble value this kind encodes to.
    pub fn nibble(self) -> u16 {
        match self {
            ResponseKind::Request => 0x0,
            ResponseKind::Ok => 0x1,
            ResponseKind::Data => 0x2,
            ResponseKind::Ticket => 0x3,
            ResponseKind::Custom => 0x4,
            ResponseKind::Error => 0xe,
            ResponseKind::Failure => 0xf,
        }
    }
}

/// A 16-bit wire opcode.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(u16);

impl Opcode {
    /// Wrap a raw opcode value.
    pub fn new(raw: u16) -> Self {
        Opcode(raw)
    }

    /// Build a request opcode for a family.
    pub fn request(family: u16) -> Self {
        Opcode(family & 0xfff0)
    }

    /// Build a response opcode: the family of `self` with a response kind.
    pub fn response(self, kind: ResponseKind) -> Self {
        Opcode((self.0 & 0xfff0) | kind.nibble())
    }

    /// Raw 16-bit value.
    pub fn raw(self) -> u16 {
        self.0
    }

    /// Request family (top 12 bits, low nibble cleared).
    pub fn family(self) -> u16 {
        self.0 & 0xfff0
    }

    /// Response kind from the low nibble, if recognized.
    pub fn kind(self) -> Option<ResponseKind> {
        ResponseKind::from_nibble(self.0 & 0x000f)
    }

    /// Whether this is a bare request (low nibble zero).
    pub fn is_request(self) -> bool {
        self.0 & 0x000f == 0
    }

    /// Whether this opcode belongs to the same family as `other`.
    pub fn same_family(self, other: Opcode) -> bool {
        self.family() == other.family()
    }

    fn family_name(self) -> &'static str {
        match self.family() {
            family::ANNOUNCE => "announce",
            family::SET_POLL_INTERVAL => "set-poll-interval",
            family::TIME_GET => "time-get",
            family::FILE_OPEN => "file-open",
            family::FILE_STAT => "file-stat",
            family::FILE_LINK => "file-link",
            family::FILE_MAKE => "file-make",
            family::FILE_REMOVE => "file-remove",
            family::TICKET_DISCARD => "ticket-discard",
            family::TICKET_READ => "ticket-read",
            family::TICKET_WRITE => "ticket-write",
            family::TICKET_GETPOS => "ticket-getpos",
            family::TICKET_SETPOS => "ticket-setpos",
            family::TIME_SET => "time-set",
            family::READ_DIR => "read-dir",
            family::FILE_PERM => "file-perm",
            family::MAKE_DIR => "make-dir",
            family::RESTART_AGENT => "restart-agent",
            family::PROCESS_OPEN => "process-open",
            family::QUIT_AGENT => "quit-agent",
            _ => "unknown",
        }
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opcode({:#06x})", self.0)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(ResponseKind::Request) => write!(f, "{}", self.family_name()),
            Some(kind) => write!(f, "{}/{:?}", self.family_name(), kind),
            None => write!(f, "{}/{:#03x}", self.family_name(), self.0 & 0xf),
        }
    }
}

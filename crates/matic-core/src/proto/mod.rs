//! Matic wire protocol: opcode space and buffer codec.

mod buffer;
mod opcode;

pub use buffer::Buffer;
pub use opcode::{Opcode, ResponseKind, family};

/// Open-mode flag bits carried in the file-open request payload.
pub mod open_flags {
    pub const READ: u32 = 0x1;
    pub const WRITE: u32 = 0x2;
    pub const CREATE: u32 = 0x4;
    pub const TRUNCATE: u32 = 0x8;
    pub const APPEND: u32 = 0x10;
}

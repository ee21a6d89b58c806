//! File and directory operations: open, stat, link, make, remove,
//! permission change, make-dir, read-dir.

use matic_core::proto::{Buffer, Opcode, ResponseKind, family};
use matic_core::{Error, Result};

use super::{OpCore, OpState, Ticket, check_reply, decode_error, decode_failure};

pub use matic_core::proto::open_flags;

/// Open a remote file, yielding a ticket.
#[derive(Debug)]
pub struct OpenOp {
    core: OpCore,
    path: String,
    flags: u32,
    mode: u32,
    ticket: Option<Ticket>,
}

impl OpenOp {
    pub fn new(path: impl Into<String>, flags: u32, mode: u32) -> Self {
        OpenOp {
            core: OpCore::new(family::FILE_OPEN),
            path: path.into(),
            flags,
            mode,
            ticket: None,
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.started()?;
        buf.write_str(&self.path)?;
        buf.write_u32(self.flags)?;
        buf.write_u32(self.mode)
    }

    pub fn parse_reply(&mut self, buf: &mut Buffer) -> Result<()> {
        self.ticket = self.core.parse_ticket_reply(buf)?;
        Ok(())
    }

    /// Ticket returned by the agent, once done.
    pub fn ticket(&self) -> Option<Ticket> {
        self.ticket
    }

    pub fn path(&self) -> &str {
        &self.path
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

/// File kind derived from the stat mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// Remote file metadata from a stat reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatInfo {
    pub size: u64,
    pub mtime: u64,
    pub mode: u32,
}

impl StatInfo {
    /// Classify the entry from the POSIX format bits of the mode.
    pub fn kind(&self) -> StatKind {
        match self.mode & 0xf000 {
            0x8000 => StatKind::File,
            0x4000 => StatKind::Directory,
            0xa000 => StatKind::Symlink,
            _ => StatKind::Other,
        }
    }
}

/// Stat a remote path.
#[derive(Debug)]
pub struct StatOp {
    core: OpCore,
    path: String,
    info: Option<StatInfo>,
}

impl StatOp {
    pub fn new(path: impl Into<String>) -> Self {
        StatOp {
            core: OpCore::new(family::FILE_STAT),
            path: path.into(),
            info: None,
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.started()?;
        buf.write_str(&self.path)
    }

    pub fn parse_reply(&mut self, buf: &mut Buffer) -> Result<()> {
        match check_reply(self.core.opcode(), buf)? {
            ResponseKind::Data => {
                let size = buf.read_u64()?;
                let mtime = buf.read_u64()?;
                let mode = buf.read_u32()?;
                self.info = Some(StatInfo { size, mtime, mode });
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

    /// Metadata from the reply, once done.
    pub fn info(&self) -> Option<StatInfo> {
        self.info
    }

    pub fn path(&self) -> &str {
        &self.path
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

/// Create a remote symlink.
#[derive(Debug)]
pub struct LinkOp {
    core: OpCore,
    target: String,
    link_path: String,
}

impl LinkOp {
    pub fn new(target: impl Into<String>, link_path: impl Into<String>) -> Self {
        LinkOp {
            core: OpCore::new(family::FILE_LINK),
            target: target.into(),
            link_path: link_path.into(),
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.started()?;
        buf.write_str(&self.target)?;
        buf.write_str(&self.link_path)
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

/// Create an empty remote file.
#[derive(Debug)]
pub struct MakeOp {
    core: OpCore,
    path: String,
    mode: u32,
}

impl MakeOp {
    pub fn new(path: impl Into<String>, mode: u32) -> Self {
        MakeOp {
            core: OpCore::new(family::FILE_MAKE),
            path: path.into(),
            mode,
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.started()?;
        buf.write_str(&self.path)?;
        buf.write_u32(self.mode)
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

/// Remove a remote file.
#[derive(Debug)]
pub struct RemoveOp {
    core: OpCore,
    path: String,
}

impl RemoveOp {
    pub fn new(path: impl Into<String>) -> Self {
        RemoveOp {
            core: OpCore::new(family::FILE_REMOVE),
            path: path.into(),
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.started()?;
        buf.write_str(&self.path)
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

/// Change permissions on a remote path.
#[derive(Debug)]
pub struct PermOp {
    core: OpCore,
    path: String,
    mode: u32,
}

impl PermOp {
    pub fn new(path: impl Into<String>, mode: u32) -> Self {
        PermOp {
            core: OpCore::new(family::FILE_PERM),
            path: path.into(),
            mode,
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.started()?;
        buf.write_str(&self.path)?;
        buf.write_u32(self.mode)
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

/// Create a remote directory.
#[derive(Debug)]
pub struct MakeDirOp {
    core: OpCore,
    path: String,
    mode: u32,
}

impl MakeDirOp {
    pub fn new(path: impl Into<String>, mode: u32) -> Self {
        MakeDirOp {
            core: OpCore::new(family::MAKE_DIR),
            path: path.into(),
            mode,
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.started()?;
        buf.write_str(&self.path)?;
        buf.write_u32(self.mode)
    }

    pub fn parse_reply(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.parse_ok_reply(buf)
    }

    pub fn path(&self) -> &str {
        &self.path
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

/// Open a remote directory listing, yielding a ticket.
///
/// The listing itself is read through ticket-read as text lines
/// `"<kind> <name>\n"` with kind one of `f`, `d`, `l`, `?`.
#[derive(Debug)]
pub struct ReadDirOp {
    core: OpCore,
    path: String,
    ticket: Option<Ticket>,
}

impl ReadDirOp {
    pub fn new(path: impl Into<String>) -> Self {
        ReadDirOp {
            core: OpCore::new(family::READ_DIR),
            path: path.into(),
            ticket: None,
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.started()?;
        buf.write_str(&self.path)
    }

    pub fn parse_reply(&mut self, buf: &mut Buffer) -> Result<()> {
        self.ticket = self.core.parse_ticket_reply(buf)?;
        Ok(())
    }

    /// Listing ticket returned by the agent, once done.
    pub fn ticket(&self) -> Option<Ticket> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::testutil::{error_reply, reply, request_buffer};
    use matic_core::proto::ResponseKind;

    #[test]
    fn open_roundtrip_yields_ticket() {
        let mut op = OpenOp::new("/etc/hosts", open_flags::READ, 0);
        let mut req = request_buffer();
        op.send_request(&mut req).unwrap();
        assert_eq!(op.state(), OpState::Started);

        let mut rsp = reply(op.opcode(), ResponseKind::Ticket, |b| {
            b.write_u32(7).unwrap();
        });
        op.parse_reply(&mut rsp).unwrap();
        assert_eq!(op.state(), OpState::Done);
        assert_eq!(op.ticket().unwrap().value(), 7);
    }

    #[test]
    fn open_request_carries_path_flags_mode() {
        let mut op = OpenOp::new("/tmp/x", open_flags::WRITE | open_flags::CREATE, 0o644);
        let mut req = request_buffer();
        op.send_request(&mut req).unwrap();

        let mut parsed =
            Buffer::parse(&req.to_wire(), false, matic_core::constants::DEFAULT_BUFFER_SIZE)
                .unwrap();
        assert_eq!(parsed.read_str().unwrap(), "/tmp/x");
        assert_eq!(parsed.read_u32().unwrap(), open_flags::WRITE | open_flags::CREATE);
        assert_eq!(parsed.read_u32().unwrap(), 0o644);
    }

    #[test]
    fn open_error_reply_records_errno() {
        let mut op = OpenOp::new("/missing", open_flags::READ, 0);
        let mut req = request_buffer();
        op.send_request(&mut req).unwrap();

        let mut rsp = error_reply(op.opcode(), 2, "No such file or directory");
        op.parse_reply(&mut rsp).unwrap();
        assert_eq!(op.state(), OpState::Failed);
        assert_eq!(op.error(), Some((2, "No such file or directory")));
        assert!(op.ticket().is_none());
    }

    #[test]
    fn stat_decodes_metadata_and_kind() {
        let mut op = StatOp::new("/etc");
        let mut req = request_buffer();
        op.send_request(&mut req).unwrap();

        let mut rsp = reply(op.opcode(), ResponseKind::Data, |b| {
            b.write_u64(4096).unwrap();
            b.write_u64(1_700_000_000).unwrap();
            b.write_u32(0o4_0755).unwrap();
        });
        op.parse_reply(&mut rsp).unwrap();

        let info = op.info().unwrap();
        assert_eq!(info.size, 4096);
        assert_eq!(info.mtime, 1_700_000_000);
        assert_eq!(info.kind(), StatKind::Directory);
    }

    #[test]
    fn stat_kind_classification() {
        let file = StatInfo { size: 0, mtime: 0, mode: 0o10_0644 };
        let link = StatInfo { size: 0, mtime: 0, mode: 0o12_0777 };
        let fifo = StatInfo { size: 0, mtime: 0, mode: 0o1_0644 };
        assert_eq!(file.kind(), StatKind::File);
        assert_eq!(link.kind(), StatKind::Symlink);
        assert_eq!(fifo.kind(), StatKind::Other);
    }

    #[test]
    fn reply_with_request_opcode_is_protocol_violation() {
        let mut op = RemoveOp::new("/tmp/x");
        let mut req = request_buffer();
        op.send_request(&mut req).unwrap();

        let mut echoed = reply(op.opcode(), ResponseKind::Request, |_| {});
        let err = op.parse_reply(&mut echoed).unwrap_err();
        assert!(matches!(err, Error::UnexpectedReply { .. }));
    }

    #[test]
    fn mkdir_ok_reply_completes() {
        let mut op = MakeDirOp::new("/tmp/newdir", 0o755);
        let mut req = request_buffer();
        op.send_request(&mut req).unwrap();

        let mut rsp = reply(op.opcode(), ResponseKind::Ok, |_| {});
        op.parse_reply(&mut rsp).unwrap();
        assert_eq!(op.state(), OpState::Done);
    }

    #[test]
    fn readdir_yields_listing_ticket() {
        let mut op = ReadDirOp::new("/var/log");
        let mut req = request_buffer();
        op.send_request(&mut req).unwrap();

        let mut rsp = reply(op.opcode(), ResponseKind::Ticket, |b| {
            b.write_u32(12).unwrap();
        });
        op.parse_reply(&mut rsp).unwrap();
        assert_eq!(op.ticket().unwrap().value(), 12);
    }

    #[test]
    fn link_request_carries_both_paths() {
        let mut op = LinkOp::new("/data/real", "/data/alias");
        let mut req = request_buffer();
        op.send_request(&mut req).unwrap();

        let mut parsed =
            Buffer::parse(&req.to_wire(), false, matic_core::constants::DEFAULT_BUFFER_SIZE)
                .unwrap();
        assert_eq!(parsed.read_str().unwrap(), "/data/real");
        assert_eq!(parsed.read_str().unwrap(), "/data/alias");
    }
}

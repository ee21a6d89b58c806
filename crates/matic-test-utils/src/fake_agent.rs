//! A scripted agent answering protocol requests from an in-memory
//! filesystem.
//!
//! The fake covers the request families the host-side machinery exercises:
//! announce, file and directory access, tickets, subprocess spawn and the
//! control operations. Paths are plain strings; a directory exists when it
//! was added explicitly or is a prefix of an added entry.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::trace;

use matic_core::constants::ENODATA_ERRNO;
use matic_core::proto::{Buffer, Opcode, ResponseKind, family, open_flags};
use matic_core::{Error, Result};

const ENOENT: u32 = 2;
const EEXIST: u32 = 17;

#[derive(Debug)]
enum TicketState {
    /// Streaming data out: file content, listing text or command output.
    Read {
        data: Vec<u8>,
        pos: usize,
        exit_status: Option<i32>,
    },
    /// Accumulating writes into a file.
    Write { path: String },
}

/// In-memory stand-in for a remote agent.
#[derive(Debug)]
pub struct FakeAgent {
    magic: u64,
    name: String,
    capabilities: Vec<String>,
    swap: bool,
    max_len: usize,
    seq: u32,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    commands: HashMap<String, (Vec<u8>, i32)>,
    tickets: HashMap<u32, TicketState>,
    next_ticket: u32,
    time: u64,
    /// Poll interval from the last announce ack, milliseconds.
    acked_poll_ms: Option<u32>,
}

impl FakeAgent {
    pub fn new(magic: u64, name: impl Into<String>) -> FakeAgent {
        FakeAgent {
            magic,
            name: name.into(),
            capabilities: vec!["file".into(), "proc".into()],
            swap: false,
            max_len: matic_core::constants::DEFAULT_BUFFER_SIZE,
            seq: 1,
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            commands: HashMap::new(),
            tickets: HashMap::new(),
            next_ticket: 1,
            time: 1_756_000_000,
            acked_poll_ms: None,
        }
    }

    /// Talk with the opposite byte order, matching a swapped pipe.
    pub fn with_swap(mut self) -> FakeAgent {
        self.swap = true;
        self
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    pub fn add_file(&mut self, path: impl Into<String>, data: impl Into<Vec<u8>>) {
        let path = path.into();
        if let Some((dir, _)) = path.rsplit_once('/') {
            if !dir.is_empty() {
                self.dirs.insert(dir.to_string());
            }
        }
        self.files.insert(path, data.into());
    }

    pub fn add_dir(&mut self, path: impl Into<String>) {
        self.dirs.insert(path.into());
    }

    pub fn add_command(&mut self, command: impl Into<String>, output: impl Into<Vec<u8>>, status: i32) {
        self.commands.insert(command.into(), (output.into(), status));
    }

    pub fn set_time(&mut self, unix_seconds: u64) {
        self.time = unix_seconds;
    }

    /// Content of a file on the fake's filesystem.
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.dirs.contains(path)
    }

    /// Poll interval the manager acked most recently, if any.
    pub fn acked_poll_ms(&self) -> Option<u32> {
        self.acked_poll_ms
    }

    pub fn open_tickets(&self) -> usize {
        self.tickets.len()
    }

    // =========================================================================
    // Wire
    // =========================================================================

    /// Announce (or poll) frame: name plus capability strings.
    pub fn announce(&mut self) -> Vec<u8> {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        let mut buf = Buffer::new(
            self.magic,
            Opcode::request(family::ANNOUNCE),
            seq,
            self.swap,
            self.max_len,
        );
        buf.write_str(&self.name).expect("announce payload fits");
        for cap in &self.capabilities {
            buf.write_str(cap).expect("announce payload fits");
        }
        buf.to_wire()
    }

    /// Consume one frame from the manager. Requests yield a reply frame;
    /// announce acks are absorbed.
    pub fn handle(&mut self, wire: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut buf = Buffer::parse(wire, self.swap, self.max_len)?;
        let opcode = buf.opcode();
        trace!(%opcode, seq = buf.sequence(), "fake agent received");
        if opcode.family() == family::ANNOUNCE && !opcode.is_request() {
            self.acked_poll_ms = Some(buf.read_u32()?);
            return Ok(None);
        }
        if !opcode.is_request() {
            return Err(Error::protocol(format!("fake agent got stray reply {opcode}")));
        }
        let reply = self.answer(&mut buf)?;
        Ok(Some(reply.to_wire()))
    }

    fn reply(&self, request: &Buffer, kind: ResponseKind) -> Buffer {
        Buffer::new(
            self.magic,
            request.opcode().response(kind),
            request.sequence(),
            self.swap,
            self.max_len,
        )
    }

    fn error(&self, request: &Buffer, errno: u32, message: &str) -> Result<Buffer> {
        let mut out = self.reply(request, ResponseKind::Error);
        out.write_u32(errno)?;
        out.write_str(message)?;
        Ok(out)
    }

    fn grant(&mut self, state: TicketState) -> u32 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.tickets.insert(ticket, state);
        ticket
    }

    fn answer(&mut self, buf: &mut Buffer) -> Result<Buffer> {
        match buf.opcode().family() {
            family::FILE_OPEN => self.answer_open(buf),
            family::FILE_STAT => self.answer_stat(buf),
            family::MAKE_DIR => self.answer_make_dir(buf),
            family::READ_DIR => self.answer_read_dir(buf),
            family::TICKET_READ => self.answer_read(buf),
            family::TICKET_WRITE => self.answer_write(buf),
            family::TICKET_DISCARD => self.answer_discard(buf),
            family::PROCESS_OPEN => self.answer_proc_open(buf),
            family::FILE_REMOVE => {
                let path = buf.read_str()?;
                if self.files.remove(&path).is_some() {
                    Ok(self.reply(buf, ResponseKind::Ok))
                } else {
                    self.error(buf, ENOENT, "No such file or directory")
                }
            }
            family::TIME_GET => {
                let mut out = self.reply(buf, ResponseKind::Data);
                out.write_u64(self.time)?;
                Ok(out)
            }
            family::TIME_SET => {
                self.time = buf.read_u64()?;
                Ok(self.reply(buf, ResponseKind::Ok))
            }
            family::SET_POLL_INTERVAL
            | family::FILE_LINK
            | family::FILE_MAKE
            | family::FILE_PERM
            | family::TICKET_SETPOS
            | family::QUIT_AGENT
            | family::RESTART_AGENT => Ok(self.reply(buf, ResponseKind::Ok)),
            family::TICKET_GETPOS => {
                let ticket = buf.read_u32()?;
                let pos = match self.tickets.get(&ticket) {
                    Some(TicketState::Read { pos, .. }) => *pos as u64,
                    Some(TicketState::Write { path }) => {
                        self.files.get(path).map(|d| d.len() as u64).unwrap_or(0)
                    }
                    None => return self.error(buf, ENOENT, "no such ticket"),
                };
                let mut out = self.reply(buf, ResponseKind::Data);
                out.write_u64(pos)?;
                Ok(out)
            }
            other => self.error(buf, 95, &format!("unsupported request {other:#06x}")),
        }
    }

    fn answer_open(&mut self, buf: &mut Buffer) -> Result<Buffer> {
        let path = buf.read_str()?;
        let flags = buf.read_u32()?;
        let _mode = buf.read_u32()?;
        if flags & open_flags::WRITE != 0 {
            if flags & open_flags::CREATE == 0 && !self.files.contains_key(&path) {
                return self.error(buf, ENOENT, "No such file or directory");
            }
            if flags & open_flags::TRUNCATE != 0 {
                self.files.insert(path.clone(), Vec::new());
            } else {
                self.files.entry(path.clone()).or_default();
            }
            let ticket = self.grant(TicketState::Write { path });
            let mut out = self.reply(buf, ResponseKind::Ticket);
            out.write_u32(ticket)?;
            return Ok(out);
        }
        match self.files.get(&path) {
            Some(data) => {
                let data = data.clone();
                let ticket = self.grant(TicketState::Read {
                    data,
                    pos: 0,
                    exit_status: None,
                });
                let mut out = self.reply(buf, ResponseKind::Ticket);
                out.write_u32(ticket)?;
                Ok(out)
            }
            None => self.error(buf, ENOENT, "No such file or directory"),
        }
    }

    fn answer_stat(&mut self, buf: &mut Buffer) -> Result<Buffer> {
        let path = buf.read_str()?;
        if let Some(data) = self.files.get(&path) {
            let mut out = self.reply(buf, ResponseKind::Data);
            out.write_u64(data.len() as u64)?;
            out.write_u64(self.time)?;
            out.write_u32(0o10_0644)?;
            return Ok(out);
        }
        if self.dirs.contains(&path) {
            let mut out = self.reply(buf, ResponseKind::Data);
            out.write_u64(0)?;
            out.write_u64(self.time)?;
            out.write_u32(0o4_0755)?;
            return Ok(out);
        }
        self.error(buf, ENOENT, "No such file or directory")
    }

    fn answer_make_dir(&mut self, buf: &mut Buffer) -> Result<Buffer> {
        let path = buf.read_str()?;
        let _mode = buf.read_u32()?;
        if self.dirs.contains(&path) {
            return self.error(buf, EEXIST, "File exists");
        }
        self.dirs.insert(path);
        Ok(self.reply(buf, ResponseKind::Ok))
    }

    /// Listing lines: `<kind> <name>`, one per direct child.
    fn listing(&self, dir: &str) -> String {
        let prefix = if dir.ends_with('/') {
            dir.to_string()
        } else {
            format!("{dir}/")
        };
        let mut lines = BTreeSet::new();
        for path in self.files.keys() {
            if let Some(rest) = path.strip_prefix(&prefix) {
                if !rest.contains('/') {
                    lines.insert(format!("f {rest}"));
                }
            }
        }
        for path in &self.dirs {
            if let Some(rest) = path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    lines.insert(format!("d {rest}"));
                }
            }
        }
        let mut out = String::new();
        for line in lines {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    fn answer_read_dir(&mut self, buf: &mut Buffer) -> Result<Buffer> {
        let path = buf.read_str()?;
        if !self.dirs.contains(&path) {
            return self.error(buf, ENOENT, "No such file or directory");
        }
        let listing = self.listing(&path).into_bytes();
        let ticket = self.grant(TicketState::Read {
            data: listing,
            pos: 0,
            exit_status: None,
        });
        let mut out = self.reply(buf, ResponseKind::Ticket);
        out.write_u32(ticket)?;
        Ok(out)
    }

    fn answer_read(&mut self, buf: &mut Buffer) -> Result<Buffer> {
        let ticket = buf.read_u32()?;
        let max = buf.read_u16()? as usize;
        let chunk = match self.tickets.get_mut(&ticket) {
            Some(TicketState::Read { data, pos, .. }) => {
                if *pos >= data.len() {
                    None
                } else {
                    let end = (*pos + max).min(data.len());
                    let chunk = data[*pos..end].to_vec();
                    *pos = end;
                    Some(chunk)
                }
            }
            _ => return self.error(buf, ENOENT, "no such ticket"),
        };
        match chunk {
            Some(chunk) => {
                let mut out = self.reply(buf, ResponseKind::Data);
                out.write_blob(&chunk)?;
                Ok(out)
            }
            None => self.error(buf, ENODATA_ERRNO, "end of data"),
        }
    }

    fn answer_write(&mut self, buf: &mut Buffer) -> Result<Buffer> {
        let ticket = buf.read_u32()?;
        let chunk = buf.read_rest();
        let Some(TicketState::Write { path }) = self.tickets.get(&ticket) else {
            return self.error(buf, ENOENT, "no such ticket");
        };
        let path = path.clone();
        if let Some(data) = self.files.get_mut(&path) {
            data.extend_from_slice(&chunk);
        }
        Ok(self.reply(buf, ResponseKind::Ok))
    }

    fn answer_discard(&mut self, buf: &mut Buffer) -> Result<Buffer> {
        let ticket = buf.read_u32()?;
        let Some(state) = self.tickets.remove(&ticket) else {
            return self.error(buf, ENOENT, "no such ticket");
        };
        let mut out = self.reply(buf, ResponseKind::Ok);
        if let TicketState::Read {
            exit_status: Some(status),
            ..
        } = state
        {
            out.write_u32(status as u32)?;
        }
        Ok(out)
    }

    fn answer_proc_open(&mut self, buf: &mut Buffer) -> Result<Buffer> {
        let command = buf.read_str()?;
        let Some((output, status)) = self.commands.get(&command).cloned() else {
            return self.error(buf, ENOENT, "No such file or directory");
        };
        let ticket = self.grant(TicketState::Read {
            data: output,
            pos: 0,
            exit_status: Some(status),
        });
        let mut out = self.reply(buf, ResponseKind::Ticket);
        out.write_u32(ticket)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: u64 = 0x1b90_f02e_10d5_1500;

    #[test]
    fn announce_carries_name_and_capabilities() {
        let mut agent = FakeAgent::new(MAGIC, "hostname");
        let wire = agent.announce();
        let mut buf = Buffer::parse(&wire, false, 4096).unwrap();
        assert_eq!(buf.magic(), MAGIC);
        assert_eq!(buf.opcode(), Opcode::request(family::ANNOUNCE));
        assert_eq!(buf.read_str().unwrap(), "hostname");
        assert_eq!(buf.read_str().unwrap(), "file");
    }

    #[test]
    fn listing_shows_direct_children_only() {
        let mut agent = FakeAgent::new(MAGIC, "hostname");
        agent.add_dir("/data");
        agent.add_file("/data/a.txt", b"alpha".to_vec());
        agent.add_file("/data/sub/b.txt", b"beta".to_vec());
        assert_eq!(agent.listing("/data"), "d sub\nf a.txt\n");
    }

    #[test]
    fn read_ticket_streams_then_signals_end() {
        let mut agent = FakeAgent::new(MAGIC, "hostname");
        agent.add_file("/f", b"abcdef".to_vec());

        let mut req = Buffer::new(MAGIC, Opcode::request(family::FILE_OPEN), 1, false, 4096);
        req.write_str("/f").unwrap();
        req.write_u32(open_flags::READ).unwrap();
        req.write_u32(0).unwrap();
        let wire = agent.handle(&req.to_wire()).unwrap().unwrap();
        let mut rsp = Buffer::parse(&wire, false, 4096).unwrap();
        assert_eq!(rsp.opcode().kind(), Some(ResponseKind::Ticket));
        let ticket = rsp.read_u32().unwrap();

        let mut req = Buffer::new(MAGIC, Opcode::request(family::TICKET_READ), 2, false, 4096);
        req.write_u32(ticket).unwrap();
        req.write_u16(4).unwrap();
        let wire = agent.handle(&req.to_wire()).unwrap().unwrap();
        let mut rsp = Buffer::parse(&wire, false, 4096).unwrap();
        assert_eq!(rsp.opcode().kind(), Some(ResponseKind::Data));
        assert_eq!(rsp.read_rest(), b"abcd".to_vec());

        let mut req = Buffer::new(MAGIC, Opcode::request(family::TICKET_READ), 3, false, 4096);
        req.write_u32(ticket).unwrap();
        req.write_u16(4).unwrap();
        let wire = agent.handle(&req.to_wire()).unwrap().unwrap();
        let mut rsp = Buffer::parse(&wire, false, 4096).unwrap();
        assert_eq!(rsp.opcode().kind(), Some(ResponseKind::Data));
        assert_eq!(rsp.read_rest(), b"ef".to_vec());

        let mut req = Buffer::new(MAGIC, Opcode::request(family::TICKET_READ), 4, false, 4096);
        req.write_u32(ticket).unwrap();
        req.write_u16(4).unwrap();
        let wire = agent.handle(&req.to_wire()).unwrap().unwrap();
        let mut rsp = Buffer::parse(&wire, false, 4096).unwrap();
        assert_eq!(rsp.opcode().kind(), Some(ResponseKind::Error));
        assert_eq!(rsp.read_u32().unwrap(), ENODATA_ERRNO);
    }
}

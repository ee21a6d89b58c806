//! Agent control operations: poll interval, target time, subprocess
//! spawn, quit and restart.

use matic_core::proto::{Buffer, Opcode, ResponseKind, family};
use matic_core::{Error, Result};

use super::{OpCore, OpState, Ticket, check_reply, decode_error, decode_failure};

/// Tell the agent how often to poll the pipe.
#[derive(Debug)]
pub struct SetPollOp {
    core: OpCore,
    millis: u32,
}

impl SetPollOp {
    pub fn new(millis: u32) -> SetPollOp {
        SetPollOp {
            core: OpCore::new(family::SET_POLL_INTERVAL),
            millis,
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.started()?;
        buf.write_u32(self.millis)
    }

    pub fn parse_reply(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.parse_ok_reply(buf)
    }

    pub fn millis(&self) -> u32 {
        self.millis
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

/// Read the target's wall-clock time.
#[derive(Debug)]
pub struct TimeGetOp {
    core: OpCore,
    time: Option<u64>,
}

impl TimeGetOp {
    pub fn new() -> TimeGetOp {
        TimeGetOp {
            core: OpCore::new(family::TIME_GET),
            time: None,
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        let _ = buf;
        self.core.started()
    }

    pub fn parse_reply(&mut self, buf: &mut Buffer) -> Result<()> {
        match check_reply(self.core.opcode(), buf)? {
            ResponseKind::Data => {
                self.time = Some(buf.read_u64()?);
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

    /// Target time in unix seconds, once done.
    pub fn time(&self) -> Option<u64> {
        self.time
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

impl Default for TimeGetOp {
    fn default() -> Self {
        Self::new()
    }
}

/// Set the target's wall-clock time.
#[derive(Debug)]
pub struct TimeSetOp {
    core: OpCore,
    time: u64,
}

impl TimeSetOp {
    pub fn new(time: u64) -> TimeSetOp {
        TimeSetOp {
            core: OpCore::new(family::TIME_SET),
            time,
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.started()?;
        buf.write_u64(self.time)
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

/// Spawn a subprocess on the target; output is read via the ticket.
#[derive(Debug)]
pub struct ProcOpenOp {
    core: OpCore,
    command: String,
    ticket: Option<Ticket>,
}

impl ProcOpenOp {
    pub fn new(command: impl Into<String>) -> ProcOpenOp {
        ProcOpenOp {
            core: OpCore::new(family::PROCESS_OPEN),
            command: command.into(),
            ticket: None,
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.started()?;
        buf.write_str(&self.command)
    }

    pub fn parse_reply(&mut self, buf: &mut Buffer) -> Result<()> {
        self.ticket = self.core.parse_ticket_reply(buf)?;
        Ok(())
    }

    /// Output ticket returned by the agent, once done.
    pub fn ticket(&self) -> Option<Ticket> {
        self.ticket
    }

    pub fn command(&self) -> &str {
        &self.command
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

/// Ask the agent to exit.
#[derive(Debug)]
pub struct QuitOp {
    core: OpCore,
    code: u32,
}

impl QuitOp {
    pub fn new(code: u32) -> QuitOp {
        QuitOp {
            core: OpCore::new(family::QUIT_AGENT),
            code,
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        self.core.started()?;
        buf.write_u32(self.code)
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

/// Ask the agent to re-exec itself.
#[derive(Debug)]
pub struct RestartOp {
    core: OpCore,
}

impl RestartOp {
    pub fn new() -> RestartOp {
        RestartOp {
            core: OpCore::new(family::RESTART_AGENT),
        }
    }

    pub fn send_request(&mut self, buf: &mut Buffer) -> Result<()> {
        let _ = buf;
        self.core.started()
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

impl Default for RestartOp {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::testutil::{reply, request_buffer};
    use matic_core::proto::ResponseKind;

    #[test]
    fn set_poll_roundtrip() {
        let mut op = SetPollOp::new(2500);
        let mut req = request_buffer();
        op.send_request(&mut req).unwrap();

        let mut parsed =
            Buffer::parse(&req.to_wire(), false, matic_core::constants::DEFAULT_BUFFER_SIZE)
                .unwrap();
        assert_eq!(parsed.read_u32().unwrap(), 2500);

        let mut rsp = reply(op.opcode(), ResponseKind::Ok, |_| {});
        op.parse_reply(&mut rsp).unwrap();
        assert_eq!(op.state(), OpState::Done);
    }

    #[test]
    fn time_get_decodes_seconds() {
        let mut op = TimeGetOp::new();
        let mut req = request_buffer();
        op.send_request(&mut req).unwrap();

        let mut rsp = reply(op.opcode(), ResponseKind::Data, |b| {
            b.write_u64(1_756_000_000).unwrap();
        });
        op.parse_reply(&mut rsp).unwrap();
        assert_eq!(op.time(), Some(1_756_000_000));
    }

    #[test]
    fn proc_open_yields_output_ticket() {
        let mut op = ProcOpenOp::new("uname -a");
        let mut req = request_buffer();
        op.send_request(&mut req).unwrap();

        let mut rsp = reply(op.opcode(), ResponseKind::Ticket, |b| {
            b.write_u32(21).unwrap();
        });
        op.parse_reply(&mut rsp).unwrap();
        assert_eq!(op.ticket().unwrap().value(), 21);
    }

    #[test]
    fn quit_and_restart_complete_on_ok() {
        let mut quit = QuitOp::new(0);
        let mut req = request_buffer();
        quit.send_request(&mut req).unwrap();
        let mut rsp = reply(quit.opcode(), ResponseKind::Ok, |_| {});
        quit.parse_reply(&mut rsp).unwrap();
        assert_eq!(quit.state(), OpState::Done);

        let mut restart = RestartOp::new();
        let mut req = request_buffer();
        restart.send_request(&mut req).unwrap();
        let mut rsp = reply(restart.opcode(), ResponseKind::Ok, |_| {});
        restart.parse_reply(&mut rsp).unwrap();
        assert_eq!(restart.state(), OpState::Done);
    }
}

//! Single-file transfer plans: download, upload, print.

use std::path::PathBuf;

use matic_core::{Error, Result};

use super::{JobPlan, require_ok};
use crate::ops::{DiscardOp, Op, OpenOp, ReadOp, WriteOp, open_flags};

/// Copy one remote file to the local filesystem.
///
/// open (read) -> read until end-of-data -> discard -> write local file.
pub struct DownloadPlan {
    remote: String,
    local: PathBuf,
    bytes: usize,
}

impl DownloadPlan {
    pub fn new(remote: impl Into<String>, local: impl Into<PathBuf>) -> DownloadPlan {
        DownloadPlan {
            remote: remote.into(),
            local: local.into(),
            bytes: 0,
        }
    }
}

impl JobPlan for DownloadPlan {
    fn next_op(&mut self, finished: Option<Op>) -> Result<Option<Op>> {
        match finished {
            None => Ok(Some(Op::Open(OpenOp::new(
                &self.remote,
                open_flags::READ,
                0,
            )))),
            Some(Op::Open(op)) => {
                require_ok("open", op.error(), op.failed())?;
                let ticket = op
                    .ticket()
                    .ok_or_else(|| Error::job("open reply carried no ticket"))?;
                Ok(Some(Op::Read(ReadOp::from_ticket(ticket))))
            }
            Some(Op::Read(mut op)) => {
                require_ok("read", op.error(), op.failed())?;
                let data = op.take_data();
                self.bytes = data.len();
                std::fs::write(&self.local, &data)?;
                Ok(Some(Op::Discard(DiscardOp::new(op.ticket()))))
            }
            Some(Op::Discard(op)) => {
                require_ok("discard", op.error(), op.failed())?;
                Ok(None)
            }
            Some(other) => Err(Error::job(format!(
                "unexpected operation {} in download",
                other.opcode()
            ))),
        }
    }

    fn summary(&self) -> String {
        format!(
            "downloaded {} to {} ({} bytes)",
            self.remote,
            self.local.display(),
            self.bytes
        )
    }
}

/// Copy one local file to the remote filesystem.
///
/// The local file is read when the plan starts; open (write, create,
/// truncate) -> chunked writes -> discard.
pub struct UploadPlan {
    local: PathBuf,
    remote: String,
    mode: u32,
    data: Option<Vec<u8>>,
    bytes: usize,
}

impl UploadPlan {
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<String>) -> UploadPlan {
        UploadPlan {
            local: local.into(),
            remote: remote.into(),
            mode: 0o644,
            data: None,
            bytes: 0,
        }
    }

    /// Permission bits for the created remote file.
    pub fn with_mode(mut self, mode: u32) -> UploadPlan {
        self.mode = mode;
        self
    }
}

impl JobPlan for UploadPlan {
    fn next_op(&mut self, finished: Option<Op>) -> Result<Option<Op>> {
        match finished {
            None => {
                let data = std::fs::read(&self.local)?;
                self.bytes = data.len();
                self.data = Some(data);
                Ok(Some(Op::Open(OpenOp::new(
                    &self.remote,
                    open_flags::WRITE | open_flags::CREATE | open_flags::TRUNCATE,
                    self.mode,
                ))))
            }
            Some(Op::Open(op)) => {
                require_ok("open", op.error(), op.failed())?;
                let ticket = op
                    .ticket()
                    .ok_or_else(|| Error::job("open reply carried no ticket"))?;
                let data = self.data.take().unwrap_or_default();
                Ok(Some(Op::Write(WriteOp::new(ticket, data))))
            }
            Some(Op::Write(op)) => {
                require_ok("write", op.error(), op.failed())?;
                Ok(Some(Op::Discard(DiscardOp::new(op.ticket()))))
            }
            Some(Op::Discard(op)) => {
                require_ok("discard", op.error(), op.failed())?;
                Ok(None)
            }
            Some(other) => Err(Error::job(format!(
                "unexpected operation {} in upload",
                other.opcode()
            ))),
        }
    }

    fn summary(&self) -> String {
        format!(
            "uploaded {} to {} ({} bytes)",
            self.local.display(),
            self.remote,
            self.bytes
        )
    }
}

/// Fetch a remote file and capture its content as job output.
pub struct PrintFilePlan {
    remote: String,
    content: String,
}

impl PrintFilePlan {
    pub fn new(remote: impl Into<String>) -> PrintFilePlan {
        PrintFilePlan {
            remote: remote.into(),
            content: String::new(),
        }
    }
}

impl JobPlan for PrintFilePlan {
    fn next_op(&mut self, finished: Option<Op>) -> Result<Option<Op>> {
        match finished {
            None => Ok(Some(Op::Open(OpenOp::new(
                &self.remote,
                open_flags::READ,
                0,
            )))),
            Some(Op::Open(op)) => {
                require_ok("open", op.error(), op.failed())?;
                let ticket = op
                    .ticket()
                    .ok_or_else(|| Error::job("open reply carried no ticket"))?;
                Ok(Some(Op::Read(ReadOp::from_ticket(ticket))))
            }
            Some(Op::Read(mut op)) => {
                require_ok("read", op.error(), op.failed())?;
                self.content = String::from_utf8_lossy(&op.take_data()).into_owned();
                Ok(Some(Op::Discard(DiscardOp::new(op.ticket()))))
            }
            Some(Op::Discard(op)) => {
                require_ok("discard", op.error(), op.failed())?;
                Ok(None)
            }
            Some(other) => Err(Error::job(format!(
                "unexpected operation {} in print",
                other.opcode()
            ))),
        }
    }

    fn output(&mut self) -> String {
        std::mem::take(&mut self.content)
    }

    fn summary(&self) -> String {
        format!("printed {}", self.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::testutil::{error_reply, reply, request_buffer};
    use matic_core::proto::{ResponseKind, family};

    fn drive(plan: &mut dyn JobPlan, mut op: Op, replies: &mut dyn FnMut(&mut Op)) -> Option<Op> {
        // Run one op through a scripted exchange and hand it back to the plan.
        replies(&mut op);
        plan.next_op(Some(op)).unwrap()
    }

    #[test]
    fn download_sequences_open_read_discard() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("out.bin");
        let mut plan = DownloadPlan::new("/data/out.bin", &local);

        let op = plan.next_op(None).unwrap().unwrap();
        assert_eq!(op.opcode().family(), family::FILE_OPEN);
        let op = drive(&mut plan, op, &mut |op| {
            let mut rsp = reply(op.opcode(), ResponseKind::Ticket, |b| {
                b.write_u32(7).unwrap();
            });
            op.parse_reply(&mut rsp).unwrap();
        })
        .unwrap();
        assert_eq!(op.opcode().family(), family::TICKET_READ);

        let op = drive(&mut plan, op, &mut |op| {
            let mut data = reply(op.opcode(), ResponseKind::Data, |b| {
                b.write_blob(b"hello").unwrap();
            });
            op.parse_reply(&mut data).unwrap();
            let mut eof = error_reply(op.opcode(), matic_core::constants::ENODATA_ERRNO, "eof");
            op.parse_reply(&mut eof).unwrap();
        })
        .unwrap();
        assert_eq!(op.opcode().family(), family::TICKET_DISCARD);
        assert_eq!(std::fs::read(&local).unwrap(), b"hello");

        let end = drive(&mut plan, op, &mut |op| {
            let mut rsp = reply(op.opcode(), ResponseKind::Ok, |_| {});
            op.parse_reply(&mut rsp).unwrap();
        });
        assert!(end.is_none());
        assert!(plan.summary().contains("5 bytes"));
    }

    #[test]
    fn download_fails_when_open_is_denied() {
        let mut plan = DownloadPlan::new("/etc/shadow", "/tmp/never");
        let mut op = plan.next_op(None).unwrap().unwrap();
        let mut rsp = error_reply(op.opcode(), 13, "Permission denied");
        op.parse_reply(&mut rsp).unwrap();
        assert!(plan.next_op(Some(op)).is_err());
    }

    #[test]
    fn upload_reads_local_file_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("in.txt");
        std::fs::write(&local, b"payload").unwrap();
        let mut plan = UploadPlan::new(&local, "/data/in.txt");

        let op = plan.next_op(None).unwrap().unwrap();
        assert_eq!(op.opcode().family(), family::FILE_OPEN);

        let mut op = drive(&mut plan, op, &mut |op| {
            let mut rsp = reply(op.opcode(), ResponseKind::Ticket, |b| {
                b.write_u32(9).unwrap();
            });
            op.parse_reply(&mut rsp).unwrap();
        })
        .unwrap();
        assert_eq!(op.opcode().family(), family::TICKET_WRITE);

        // One chunk suffices for a small file.
        let mut req = request_buffer();
        op.send_request(&mut req).unwrap();
        let mut rsp = reply(op.opcode(), ResponseKind::Ok, |_| {});
        op.parse_reply(&mut rsp).unwrap();
        assert!(matches!(
            op.send_request(&mut request_buffer()),
            Err(matic_core::Error::EndOfData)
        ));

        let op = plan.next_op(Some(op)).unwrap().unwrap();
        assert_eq!(op.opcode().family(), family::TICKET_DISCARD);
        assert!(plan.summary().contains("7 bytes"));
    }

    #[test]
    fn upload_fails_when_local_file_is_missing() {
        let mut plan = UploadPlan::new("/no/such/file", "/data/x");
        assert!(plan.next_op(None).is_err());
    }

    #[test]
    fn print_captures_content_as_output() {
        let mut plan = PrintFilePlan::new("/proc/version");
        let op = plan.next_op(None).unwrap().unwrap();
        let op = drive(&mut plan, op, &mut |op| {
            let mut rsp = reply(op.opcode(), ResponseKind::Ticket, |b| {
                b.write_u32(3).unwrap();
            });
            op.parse_reply(&mut rsp).unwrap();
        })
        .unwrap();
        let op = drive(&mut plan, op, &mut |op| {
            let mut data = reply(op.opcode(), ResponseKind::Data, |b| {
                b.write_blob(b"Linux 6.1").unwrap();
            });
            op.parse_reply(&mut data).unwrap();
            let mut eof = error_reply(op.opcode(), matic_core::constants::ENODATA_ERRNO, "eof");
            op.parse_reply(&mut eof).unwrap();
        })
        .unwrap();
        let end = drive(&mut plan, op, &mut |op| {
            let mut rsp = reply(op.opcode(), ResponseKind::Ok, |_| {});
            op.parse_reply(&mut rsp).unwrap();
        });
        assert!(end.is_none());
        assert_eq!(plan.output(), "Linux 6.1");
    }
}

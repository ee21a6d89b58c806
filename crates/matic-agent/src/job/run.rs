//! Remote command execution plan.

use matic_core::{Error, Result};

use super::{JobPlan, require_ok};
use crate::ops::{DiscardOp, Op, ProcOpenOp, ReadOp};

/// Run a command on the target and capture its output.
///
/// process-open -> read output until end-of-data -> discard, which also
/// reaps the exit status.
pub struct RunPlan {
    command: String,
    output: String,
    exit_status: Option<i32>,
}

impl RunPlan {
    pub fn new(command: impl Into<String>) -> RunPlan {
        RunPlan {
            command: command.into(),
            output: String::new(),
            exit_status: None,
        }
    }
}

impl JobPlan for RunPlan {
    fn next_op(&mut self, finished: Option<Op>) -> Result<Option<Op>> {
        match finished {
            None => Ok(Some(Op::ProcOpen(ProcOpenOp::new(&self.command)))),
            Some(Op::ProcOpen(op)) => {
                require_ok("process-open", op.error(), op.failed())?;
                let ticket = op
                    .ticket()
                    .ok_or_else(|| Error::job("process-open reply carried no ticket"))?;
                Ok(Some(Op::Read(ReadOp::from_ticket(ticket))))
            }
            Some(Op::Read(mut op)) => {
                require_ok("read", op.error(), op.failed())?;
                self.output = String::from_utf8_lossy(&op.take_data()).into_owned();
                Ok(Some(Op::Discard(DiscardOp::new(op.ticket()))))
            }
            Some(Op::Discard(op)) => {
                require_ok("discard", op.error(), op.failed())?;
                self.exit_status = op.exit_status();
                Ok(None)
            }
            Some(other) => Err(Error::job(format!(
                "unexpected operation {} in run",
                other.opcode()
            ))),
        }
    }

    fn output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    fn summary(&self) -> String {
        match self.exit_status {
            Some(status) => format!("`{}` exited with status {status}", self.command),
            None => format!("`{}` finished", self.command),
        }
    }
}

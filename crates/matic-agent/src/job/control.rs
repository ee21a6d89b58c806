//! Channel and agent control plans.

use std::time::Duration;

use matic_core::{Error, Result};

use super::{JobPlan, require_ok};
use crate::ops::{Op, QuitOp, RestartOp, SetPollOp, TimeGetOp, TimeSetOp};

/// Change the agent's poll interval. The owning channel adopts the new
/// interval once the agent acknowledges.
pub struct PollIntervalPlan {
    interval: Duration,
}

impl PollIntervalPlan {
    pub fn new(interval: Duration) -> PollIntervalPlan {
        PollIntervalPlan { interval }
    }
}

impl JobPlan for PollIntervalPlan {
    fn next_op(&mut self, finished: Option<Op>) -> Result<Option<Op>> {
        match finished {
            None => Ok(Some(Op::SetPoll(SetPollOp::new(
                self.interval.as_millis() as u32,
            )))),
            Some(Op::SetPoll(op)) => {
                require_ok("set-poll-interval", op.error(), op.failed())?;
                Ok(None)
            }
            Some(other) => Err(Error::job(format!(
                "unexpected operation {} in poll-interval",
                other.opcode()
            ))),
        }
    }

    fn summary(&self) -> String {
        format!("poll interval set to {} ms", self.interval.as_millis())
    }

    fn poll_interval_update(&self) -> Option<Duration> {
        Some(self.interval)
    }
}

/// Ask the agent to exit; the channel retires when the job completes.
pub struct QuitPlan {
    code: u32,
}

impl QuitPlan {
    pub fn new(code: u32) -> QuitPlan {
        QuitPlan { code }
    }
}

impl JobPlan for QuitPlan {
    fn next_op(&mut self, finished: Option<Op>) -> Result<Option<Op>> {
        match finished {
            None => Ok(Some(Op::Quit(QuitOp::new(self.code)))),
            Some(Op::Quit(op)) => {
                require_ok("quit", op.error(), op.failed())?;
                Ok(None)
            }
            Some(other) => Err(Error::job(format!(
                "unexpected operation {} in quit",
                other.opcode()
            ))),
        }
    }

    fn summary(&self) -> String {
        format!("agent asked to quit with code {}", self.code)
    }

    fn retires_channel(&self) -> bool {
        true
    }
}

/// Ask the agent to re-exec itself. The channel retires; the restarted
/// agent announces itself afresh.
pub struct RestartPlan;

impl JobPlan for RestartPlan {
    fn next_op(&mut self, finished: Option<Op>) -> Result<Option<Op>> {
        match finished {
            None => Ok(Some(Op::Restart(RestartOp::new()))),
            Some(Op::Restart(op)) => {
                require_ok("restart", op.error(), op.failed())?;
                Ok(None)
            }
            Some(other) => Err(Error::job(format!(
                "unexpected operation {} in restart",
                other.opcode()
            ))),
        }
    }

    fn summary(&self) -> String {
        "agent asked to restart".into()
    }

    fn retires_channel(&self) -> bool {
        true
    }
}

/// Read or set the target's wall-clock time.
pub enum TimeSyncPlan {
    /// Query the target time; the result becomes the job output.
    Get { time: Option<u64> },
    /// Push a unix timestamp to the target.
    Set { time: u64 },
}

impl TimeSyncPlan {
    pub fn get() -> TimeSyncPlan {
        TimeSyncPlan::Get { time: None }
    }

    pub fn set(time: u64) -> TimeSyncPlan {
        TimeSyncPlan::Set { time }
    }
}

impl JobPlan for TimeSyncPlan {
    fn next_op(&mut self, finished: Option<Op>) -> Result<Option<Op>> {
        match (finished, &mut *self) {
            (None, TimeSyncPlan::Get { .. }) => Ok(Some(Op::TimeGet(TimeGetOp::new()))),
            (None, TimeSyncPlan::Set { time }) => Ok(Some(Op::TimeSet(TimeSetOp::new(*time)))),
            (Some(Op::TimeGet(op)), TimeSyncPlan::Get { time }) => {
                require_ok("time-get", op.error(), op.failed())?;
                *time = op.time();
                Ok(None)
            }
            (Some(Op::TimeSet(op)), TimeSyncPlan::Set { .. }) => {
                require_ok("time-set", op.error(), op.failed())?;
                Ok(None)
            }
            (Some(other), _) => Err(Error::job(format!(
                "unexpected operation {} in time-sync",
                other.opcode()
            ))),
        }
    }

    fn output(&mut self) -> String {
        match self {
            TimeSyncPlan::Get { time: Some(t) } => format!("target time: {t}\n"),
            _ => String::new(),
        }
    }

    fn summary(&self) -> String {
        match self {
            TimeSyncPlan::Get { .. } => "target time queried".into(),
            TimeSyncPlan::Set { time } => format!("target time set to {time}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::testutil::reply;
    use matic_core::proto::{ResponseKind, family};

    #[test]
    fn poll_interval_plan_reports_update() {
        let mut plan = PollIntervalPlan::new(Duration::from_millis(2500));
        assert_eq!(plan.poll_interval_update(), Some(Duration::from_millis(2500)));

        let mut op = plan.next_op(None).unwrap().unwrap();
        assert_eq!(op.opcode().family(), family::SET_POLL_INTERVAL);
        let mut rsp = reply(op.opcode(), ResponseKind::Ok, |_| {});
        op.parse_reply(&mut rsp).unwrap();
        assert!(plan.next_op(Some(op)).unwrap().is_none());
    }

    #[test]
    fn quit_and_restart_retire_the_channel() {
        assert!(QuitPlan::new(0).retires_channel());
        assert!(RestartPlan.retires_channel());

        let mut plan = QuitPlan::new(1);
        let mut op = plan.next_op(None).unwrap().unwrap();
        assert_eq!(op.opcode().family(), family::QUIT_AGENT);
        let mut rsp = reply(op.opcode(), ResponseKind::Ok, |_| {});
        op.parse_reply(&mut rsp).unwrap();
        assert!(plan.next_op(Some(op)).unwrap().is_none());
    }

    #[test]
    fn time_get_captures_output() {
        let mut plan = TimeSyncPlan::get();
        let mut op = plan.next_op(None).unwrap().unwrap();
        assert_eq!(op.opcode().family(), family::TIME_GET);
        let mut rsp = reply(op.opcode(), ResponseKind::Data, |b| {
            b.write_u64(1_756_080_000).unwrap();
        });
        op.parse_reply(&mut rsp).unwrap();
        assert!(plan.next_op(Some(op)).unwrap().is_none());
        assert_eq!(plan.output(), "target time: 1756080000\n");
    }
}

use std::time::{Duration, Instant};

use crate::errors::{Result, VigilError};
use crate::event_loop::{Scheduler, TimerId};

/// Last known responsiveness of the managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Unknown,
    Alive,
    Unresponsive,
}

/// Result of feeding an acknowledgement to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Matched the outstanding probe; its timeout was cancelled.
    Accepted,
    /// Answered a probe that already timed out or was abandoned.
    Late,
    /// Carried a sequence number that was never issued.
    Unexpected,
}

/// Result of a heartbeat timeout timer firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// The outstanding probe went unanswered.
    Unresponsive,
    /// The timer belonged to a probe that was already settled.
    Stale,
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    seq: u64,
    timer: TimerId,
}

/// Tracks one in-flight liveness probe at a time.
///
/// The monitor only does bookkeeping: it arms and cancels the timeout on the
/// caller's scheduler and decides what a reply or timeout means. Sending the
/// probe is up to the caller.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    timeout: Duration,
    last_seq: u64,
    outstanding: Option<Outstanding>,
    liveness: Liveness,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_seq: 0,
            outstanding: None,
            liveness: Liveness::Unknown,
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    /// Sequence number of the probe awaiting a reply, if any.
    pub fn outstanding(&self) -> Option<u64> {
        self.outstanding.map(|o| o.seq)
    }

    /// Issue a new probe and arm its timeout. `token` builds the scheduler
    /// token for the timeout from the probe's sequence number.
    ///
    /// Fails with [`VigilError::ProbeOutstanding`] if the previous probe has
    /// neither been answered nor timed out.
    pub fn probe<T, F>(&mut self, timers: &mut Scheduler<T>, now: Instant, token: F) -> Result<u64>
    where
        T: Clone,
        F: FnOnce(u64) -> T,
    {
        if let Some(outstanding) = self.outstanding {
            return Err(VigilError::ProbeOutstanding {
                seq: outstanding.seq,
            });
        }
        self.last_seq += 1;
        let seq = self.last_seq;
        let timer = timers.once(now, self.timeout, token(seq));
        self.outstanding = Some(Outstanding { seq, timer });
        Ok(seq)
    }

    pub fn on_reply<T: Clone>(&mut self, timers: &mut Scheduler<T>, seq: u64) -> ReplyOutcome {
        match self.outstanding {
            Some(outstanding) if outstanding.seq == seq => {
                timers.cancel(outstanding.timer);
                self.outstanding = None;
                self.liveness = Liveness::Alive;
                ReplyOutcome::Accepted
            }
            _ if seq == 0 || seq > self.last_seq => ReplyOutcome::Unexpected,
            _ => ReplyOutcome::Late,
        }
    }

    pub fn on_timeout(&mut self, seq: u64) -> TimeoutOutcome {
        match self.outstanding {
            Some(outstanding) if outstanding.seq == seq => {
                self.outstanding = None;
                self.liveness = Liveness::Unresponsive;
                TimeoutOutcome::Unresponsive
            }
            _ => TimeoutOutcome::Stale,
        }
    }

    /// Abandon the outstanding probe, if any, cancelling its timeout.
    /// Replies to it will be reported as late.
    pub fn pause<T: Clone>(&mut self, timers: &mut Scheduler<T>) {
        if let Some(outstanding) = self.outstanding.take() {
            timers.cancel(outstanding.timer);
        }
    }

    /// Abandon the outstanding probe and forget the last liveness verdict.
    pub fn reset<T: Clone>(&mut self, timers: &mut Scheduler<T>) {
        self.pause(timers);
        self.liveness = Liveness::Unknown;
    }
}

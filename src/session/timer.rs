use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOp {
    Start,
    Reset,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Sends `PINGREQ` when idle and detects a silent peer.
    KeepAlive,
    /// Retransmits unacknowledged publishes.
    Retry,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKind::KeepAlive => f.write_str("keep-alive"),
            TimerKind::Retry => f.write_str("retry"),
        }
    }
}

/// A request from the protocol engine to start, reset or stop one of its timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub op: TimerOp,
    pub kind: TimerKind,
    pub duration: Option<Duration>,
}

impl TimerRequest {
    pub fn start(kind: TimerKind, duration: Duration) -> Self {
        Self {
            op: TimerOp::Start,
            kind,
            duration: Some(duration),
        }
    }

    pub fn reset(kind: TimerKind, duration: Duration) -> Self {
        Self {
            op: TimerOp::Reset,
            kind,
            duration: Some(duration),
        }
    }

    pub fn stop(kind: TimerKind) -> Self {
        Self {
            op: TimerOp::Stop,
            kind,
            duration: None,
        }
    }
}

#[derive(Default)]
struct Slot {
    sleep: Option<Pin<Box<Sleep>>>,
    period: Option<Duration>,
}

impl Slot {
    fn arm(&mut self, duration: Duration) {
        self.period = Some(duration);
        let deadline = Instant::now() + duration;
        match &mut self.sleep {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.sleep = Some(Box::pin(tokio::time::sleep_until(deadline))),
        }
    }

    fn apply(&mut self, op: TimerOp, duration: Option<Duration>) {
        match op {
            TimerOp::Start | TimerOp::Reset => {
                if let Some(duration) = duration.or(self.period) {
                    self.arm(duration);
                }
            }
            TimerOp::Stop => self.sleep = None,
        }
    }
}

/// One-shot keep-alive and retry timers owned by a session.
///
/// Timers are polled by the session's event loop, so an expiry is handled on the same task as
/// every other session event.
#[derive(Default)]
pub struct Timers {
    keep_alive: Slot,
    retry: Slot,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, request: TimerRequest) {
        self.slot(request.kind).apply(request.op, request.duration);
    }

    #[cfg(test)]
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::KeepAlive => self.keep_alive.sleep.is_some(),
            TimerKind::Retry => self.retry.sleep.is_some(),
        }
    }

    pub fn cancel_all(&mut self) {
        self.keep_alive.sleep = None;
        self.retry.sleep = None;
    }

    /// Wait for the next armed timer to fire and disarm it.
    ///
    /// Never completes while no timer is armed. Cancellation safe.
    pub async fn wait(&mut self) -> TimerKind {
        let fired = match (&mut self.keep_alive.sleep, &mut self.retry.sleep) {
            (Some(keep_alive), Some(retry)) => {
                tokio::select! {
                    _ = keep_alive.as_mut() => TimerKind::KeepAlive,
                    _ = retry.as_mut() => TimerKind::Retry,
                }
            }
            (Some(keep_alive), None) => {
                keep_alive.as_mut().await;
                TimerKind::KeepAlive
            }
            (None, Some(retry)) => {
                retry.as_mut().await;
                TimerKind::Retry
            }
            (None, None) => futures::future::pending().await,
        };
        self.slot(fired).sleep = None;
        fired
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Slot {
        match kind {
            TimerKind::KeepAlive => &mut self.keep_alive,
            TimerKind::Retry => &mut self.retry,
        }
    }
}

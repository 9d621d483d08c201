//! Timers that report back to the network manager.
//!
//! A timer task never touches layer state. When it fires it sends a
//! [`TimerEvent`] to the manager, which handles it like any other input.
//! Dropping the [`TimerToken`] aborts the task, so a timer lives exactly as
//! long as the state that owns its token.

use mesh_wire::Address;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// What a timer fires for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Acknowledge segments received from `source`
    SegmentAck {
        /// Sender of the segmented message
        source: Address,
        /// SeqZero of the message
        seq_zero: u16,
    },
    /// Give up reassembling a message from `source`
    IncompleteTimeout {
        /// Sender of the segmented message
        source: Address,
        /// SeqZero of the message
        seq_zero: u16,
    },
    /// Retransmit unacknowledged segments of the message in flight
    Retransmit {
        /// Destination of the message
        destination: Address,
        /// Identifier of the outgoing message
        id: u64,
    },
    /// Publish the next Heartbeat
    HeartbeatPublication,
}

/// Cancels its timer when dropped
#[derive(Debug)]
pub struct TimerToken {
    handle: JoinHandle<()>,
}

impl TimerToken {
    /// Cancel explicitly
    pub fn cancel(self) {}
}

impl Drop for TimerToken {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawns timers on the current tokio runtime
#[derive(Debug, Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<TimerEvent>,
}

impl Scheduler {
    /// Create a scheduler reporting to `tx`
    pub fn new(tx: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self { tx }
    }

    /// Fire `event` once after `delay`
    pub fn schedule(&self, delay: Duration, event: TimerEvent) -> TimerToken {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(event).is_err() {
                debug!("timer fired after manager stopped");
            }
        });
        TimerToken { handle }
    }

    /// Fire `event` every `period`, first after one period
    pub fn schedule_repeating(&self, period: Duration, event: TimerEvent) -> TimerToken {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if tx.send(event.clone()).is_err() {
                    break;
                }
            }
        });
        TimerToken { handle }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(tx);
        let start = Instant::now();
        let _token = scheduler.schedule(Duration::from_millis(150), TimerEvent::HeartbeatPublication);

        assert_eq!(rx.recv().await, Some(TimerEvent::HeartbeatPublication));
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_token_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(tx);
        let token = scheduler.schedule(Duration::from_millis(10), TimerEvent::HeartbeatPublication);
        drop(token);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(tx);
        let token = scheduler.schedule_repeating(Duration::from_secs(1), TimerEvent::HeartbeatPublication);
        for _ in 0..3 {
            assert_eq!(rx.recv().await, Some(TimerEvent::HeartbeatPublication));
        }
        token.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }
}

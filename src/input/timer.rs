//! Delayed work for the input session
//!
//! The session never sleeps itself. It hands an [`InputTimer`] to a
//! [`Scheduler`], which delivers it back after the delay. Each timer carries
//! the token and device it was scheduled for so late deliveries can be told
//! apart from current ones.

use std::time::Duration;
use tokio::sync::mpsc;

/// What to do when a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Settle delay over: start the capture
    Spawn,
    /// Backoff over: clear leftovers and settle again
    Retry,
    /// A spawned capture survived the busy-detection window
    Confirm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputTimer {
    pub token: u64,
    pub device: String,
    pub action: TimerAction,
}

/// Delivers timers back to the input session after a delay
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, timer: InputTimer);
}

/// Scheduler that posts fired timers onto a channel
#[derive(Clone)]
pub struct ChannelScheduler {
    tx: mpsc::UnboundedSender<InputTimer>,
}

impl ChannelScheduler {
    pub fn new(tx: mpsc::UnboundedSender<InputTimer>) -> Self {
        Self { tx }
    }
}

impl Scheduler for ChannelScheduler {
    fn schedule(&self, delay: Duration, timer: InputTimer) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(timer);
        });
    }
}

/// Scheduler that only records what was asked of it
#[cfg(test)]
#[derive(Clone, Default)]
pub struct RecordingScheduler {
    scheduled: std::sync::Arc<std::sync::Mutex<Vec<(Duration, InputTimer)>>>,
}

#[cfg(test)]
impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything scheduled so far, oldest first
    pub fn scheduled(&self) -> Vec<(Duration, InputTimer)> {
        self.scheduled
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Remove and return the most recent timer
    pub fn pop(&self) -> Option<(Duration, InputTimer)> {
        self.scheduled.lock().ok()?.pop()
    }
}

#[cfg(test)]
impl Scheduler for RecordingScheduler {
    fn schedule(&self, delay: Duration, timer: InputTimer) {
        if let Ok(mut scheduled) = self.scheduled.lock() {
            scheduled.push((delay, timer));
        }
    }
}

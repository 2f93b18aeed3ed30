//! Input session: the one capture process feeding the duplicator
//!
//! State machine:
//!
//! ```text
//!   Void ──switch──▶ Starting ──first audio / quiet window──▶ Streaming
//!                       │  ▲                      │
//!           busy / exit │  │ backoff / restart    │ unrequested exit
//!                       ▼  │                      ▼
//!                     Retrying ◀──────────────────┘
//!                       │
//!                       └──limit reached──▶ Failed
//! ```
//!
//! Switching to the null input returns to `Void` from anywhere; switching to
//! a device starts over from `Starting`.
//!
//! Busy errors are only retried while a manual switch is in flight. The
//! switch ends with the first audio chunk or, for sources that stay silent,
//! once the capture has run for [`SPAWN_CONFIRM_WINDOW`] without failing.
//! Later exits are crashes and follow the restart policy.
//!
//! The manager is driven entirely by events (process events, duplicator
//! events, timers) and returns the notices the control surface should see.
//! It never blocks and never sleeps.

pub mod timer;

pub use timer::{ChannelScheduler, InputTimer, Scheduler, TimerAction};

use crate::catalog::NULL_INPUT_ID;
use crate::error::InputError;
use crate::output::duplicator::Feeder;
use crate::process::{ExitInfo, ProcessEvent, ProcessEventKind, ProcessHandle, ProcessId, ProcessLauncher};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Wait between clearing a device and opening it
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// How long a fresh capture must survive before the switch counts as done
pub const SPAWN_CONFIRM_WINDOW: Duration = Duration::from_millis(1000);

/// First busy-retry delay; doubles on every further attempt
pub const BUSY_RETRY_BASE: Duration = Duration::from_millis(200);

/// Busy retries before giving up
pub const MAX_BUSY_RETRIES: u32 = 5;

/// Wait before restarting a crashed capture
pub const CRASH_RESTART_DELAY: Duration = Duration::from_millis(2000);

/// Crash restarts before giving up
pub const MAX_CRASH_RESTARTS: u32 = 3;

/// Delay before busy retry number `attempt` (1-based)
pub fn busy_retry_delay(attempt: u32) -> Duration {
    BUSY_RETRY_BASE * 2u32.pow(attempt.saturating_sub(1))
}

/// Whether a capture stderr line reports a busy device
pub fn is_busy_line(line: &str) -> bool {
    let line = line.to_lowercase();
    line.contains("device or resource busy") || line.contains("audio open error")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Void,
    Starting,
    Streaming,
    Retrying,
    Failed,
}

impl fmt::Display for InputState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InputState::Void => "void",
            InputState::Starting => "starting",
            InputState::Streaming => "streaming",
            InputState::Retrying => "retrying",
            InputState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What the control surface should hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputNotice {
    Changed(String),
    Status(String),
    Error(String),
}

/// State of the single input session
#[derive(Debug)]
pub struct InputSession {
    pub current_input: String,
    pub capture: Option<ProcessHandle>,
    pub state: InputState,
    pub manual_switch_in_flight: bool,
    pub busy_retry_count: u32,
    pub crash_restart_count: u32,
    /// Token of the only timer allowed to act
    pending: Option<u64>,
    next_token: u64,
}

impl Default for InputSession {
    fn default() -> Self {
        Self {
            current_input: NULL_INPUT_ID.to_string(),
            capture: None,
            state: InputState::Void,
            manual_switch_in_flight: false,
            busy_retry_count: 0,
            crash_restart_count: 0,
            pending: None,
            next_token: 1,
        }
    }
}

pub struct InputManager {
    session: InputSession,
    launcher: Arc<dyn ProcessLauncher>,
    scheduler: Arc<dyn Scheduler>,
    feeder: Feeder,
}

impl InputManager {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, scheduler: Arc<dyn Scheduler>, feeder: Feeder) -> Self {
        Self {
            session: InputSession::default(),
            launcher,
            scheduler,
            feeder,
        }
    }

    pub fn session(&self) -> &InputSession {
        &self.session
    }

    pub fn current_input(&self) -> &str {
        &self.session.current_input
    }

    pub fn state(&self) -> InputState {
        self.session.state
    }

    /// Process id of the running capture, if any
    pub fn capture_id(&self) -> Option<ProcessId> {
        self.session.capture.as_ref().map(ProcessHandle::id)
    }

    /// Select a new input; the null input stops capturing
    pub fn switch_input(&mut self, id: &str) -> Vec<InputNotice> {
        tracing::info!("Switching input to '{}'", id);
        let session = &mut self.session;
        session.manual_switch_in_flight = true;
        session.busy_retry_count = 0;
        session.crash_restart_count = 0;
        session.pending = None;
        session.current_input = id.to_string();
        self.teardown();

        let notices = vec![InputNotice::Changed(id.to_string())];
        if id == NULL_INPUT_ID {
            self.session.state = InputState::Void;
            self.session.manual_switch_in_flight = false;
            return notices;
        }

        self.session.state = InputState::Starting;
        self.prepare(id);
        notices
    }

    /// A scheduled timer fired
    pub fn on_timer(&mut self, timer: InputTimer) -> Vec<InputNotice> {
        if self.session.pending != Some(timer.token) || timer.device != self.session.current_input {
            tracing::debug!(
                "Ignoring stale {:?} timer for '{}' (token {})",
                timer.action,
                timer.device,
                timer.token
            );
            return Vec::new();
        }
        self.session.pending = None;

        match timer.action {
            TimerAction::Retry => {
                self.prepare(&timer.device);
                Vec::new()
            }
            TimerAction::Spawn => self.spawn(&timer.device),
            TimerAction::Confirm => self.confirm_started("no audio yet"),
        }
    }

    pub fn on_process_event(&mut self, event: &ProcessEvent) -> Vec<InputNotice> {
        if self.capture_id() != Some(event.id) {
            return Vec::new();
        }
        match &event.kind {
            ProcessEventKind::Stderr(line) => self.on_stderr(line),
            ProcessEventKind::Exited(info) => self.on_exit(*info),
        }
    }

    /// First audio from a capture confirms the start
    pub fn on_source_flowing(&mut self, tag: ProcessId) -> Vec<InputNotice> {
        if self.capture_id() != Some(tag) {
            return Vec::new();
        }
        if self.session.state == InputState::Starting {
            // The confirm timer is the only one pending while starting
            self.session.pending = None;
        }
        self.confirm_started("audio flowing")
    }

    fn confirm_started(&mut self, reason: &str) -> Vec<InputNotice> {
        if self.session.capture.is_none() {
            return Vec::new();
        }
        let session = &mut self.session;
        let was_switch = session.manual_switch_in_flight;
        let was_streaming = session.state == InputState::Streaming;
        session.state = InputState::Streaming;
        session.manual_switch_in_flight = false;
        if was_streaming {
            return Vec::new();
        }
        tracing::info!("Input '{}' is streaming ({})", session.current_input, reason);

        if !was_switch && session.crash_restart_count > 0 {
            return vec![InputNotice::Status(format!(
                "Input '{}' restored",
                session.current_input
            ))];
        }
        Vec::new()
    }

    /// Stop the capture for good
    pub async fn shutdown(&mut self) {
        self.session.pending = None;
        self.feeder.clear_source();
        if let Some(capture) = self.session.capture.take() {
            capture.shutdown().await;
        }
    }

    fn on_stderr(&mut self, line: &str) -> Vec<InputNotice> {
        if !is_busy_line(line) {
            tracing::debug!("Capture: {}", line);
            return Vec::new();
        }
        if !self.session.manual_switch_in_flight {
            tracing::warn!("Capture reports busy device: {}", line);
            return Vec::new();
        }

        self.teardown();
        let device = self.session.current_input.clone();
        self.session.busy_retry_count += 1;
        let attempt = self.session.busy_retry_count;

        if attempt > MAX_BUSY_RETRIES {
            let error = InputError::DeviceBusy {
                device,
                attempts: attempt,
            };
            return self.fail(error);
        }

        let delay = busy_retry_delay(attempt);
        tracing::info!(
            "Input '{}' busy, retry {}/{} in {}ms",
            device,
            attempt,
            MAX_BUSY_RETRIES,
            delay.as_millis()
        );
        self.session.state = InputState::Retrying;
        self.schedule(delay, TimerAction::Retry);
        vec![InputNotice::Status(format!(
            "Input is busy, retrying ({}/{})",
            attempt, MAX_BUSY_RETRIES
        ))]
    }

    fn on_exit(&mut self, info: ExitInfo) -> Vec<InputNotice> {
        if info.requested {
            return Vec::new();
        }
        self.feeder.clear_source();
        self.session.capture = None;
        let device = self.session.current_input.clone();

        if self.session.manual_switch_in_flight {
            return self.fail(InputError::StartFailed {
                device,
                reason: info.to_string(),
            });
        }

        if info.is_clean() {
            tracing::info!("Input '{}' ended", device);
            self.session.state = InputState::Failed;
            return vec![InputNotice::Error(format!(
                "Input '{}' ended. Please reselect the input.",
                device
            ))];
        }

        self.session.crash_restart_count += 1;
        let restarts = self.session.crash_restart_count;
        if restarts > MAX_CRASH_RESTARTS {
            return self.fail(InputError::UnexpectedExit {
                device,
                restarts: MAX_CRASH_RESTARTS,
            });
        }

        tracing::warn!(
            "Input '{}' stopped unexpectedly ({}), restart {}/{}",
            device,
            info,
            restarts,
            MAX_CRASH_RESTARTS
        );
        self.session.state = InputState::Retrying;
        self.schedule(CRASH_RESTART_DELAY, TimerAction::Retry);
        vec![InputNotice::Status(format!(
            "Input stopped unexpectedly, restarting ({}/{})",
            restarts, MAX_CRASH_RESTARTS
        ))]
    }

    /// Clear leftovers holding the device, then wait for it to settle
    fn prepare(&mut self, device: &str) {
        self.launcher.kill_orphans(device);
        self.schedule(SETTLE_DELAY, TimerAction::Spawn);
    }

    fn spawn(&mut self, device: &str) -> Vec<InputNotice> {
        // Never two captures on the duplicator
        self.teardown();

        match self.launcher.spawn_capture(device) {
            Ok(mut handle) => {
                match handle.take_stdout() {
                    Some(stdout) => self.feeder.set_source(handle.id(), stdout),
                    None => tracing::warn!("Capture {} has no stdout", handle.id()),
                }
                tracing::debug!("Capture {} started on '{}'", handle.id(), device);
                self.session.capture = Some(handle);
                self.session.state = InputState::Starting;
                self.schedule(SPAWN_CONFIRM_WINDOW, TimerAction::Confirm);
                Vec::new()
            }
            Err(e) => self.fail(InputError::StartFailed {
                device: device.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn teardown(&mut self) {
        self.feeder.clear_source();
        if let Some(capture) = self.session.capture.take() {
            tracing::debug!("Stopping capture {}", capture.id());
            capture.terminate(true);
        }
    }

    fn fail(&mut self, error: InputError) -> Vec<InputNotice> {
        tracing::error!("{}", error);
        self.teardown();
        self.session.state = InputState::Failed;
        self.session.manual_switch_in_flight = false;
        self.session.pending = None;
        vec![InputNotice::Error(error.to_string())]
    }

    fn schedule(&mut self, delay: Duration, action: TimerAction) {
        let token = self.session.next_token;
        self.session.next_token += 1;
        self.session.pending = Some(token);
        self.scheduler.schedule(
            delay,
            InputTimer {
                token,
                device: self.session.current_input.clone(),
                action,
            },
        );
    }
}

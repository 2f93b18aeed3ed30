//! Supervision of external PCM programs
//!
//! Capture and playback are delegated to external programs (arecord/aplay by
//! default) that exchange raw PCM over their stdio. Every spawned program gets
//! a monitor task that forwards its stderr lines and reports exactly one exit
//! event on a shared channel, so callers never block on a process.
//!
//! All programs use the same fixed format: 2 channels, S16_LE, 44100 Hz.

#[cfg(test)]
pub mod fake;
pub mod orphans;
pub mod supervisor;

pub use supervisor::Supervisor;

use crate::error::ProcessError;
use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Channels in every PCM stream
pub const CHANNELS: u16 = 2;

/// Sample format in every PCM stream (ALSA name)
pub const SAMPLE_FORMAT: &str = "S16_LE";

/// Sample rate in every PCM stream
pub const SAMPLE_RATE: u32 = 44100;

/// How long a process gets to exit after SIGINT before it is killed
pub const GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Raw PCM coming out of a process
pub type PcmReader = Box<dyn AsyncRead + Send + Unpin>;

/// Raw PCM going into a process
pub type PcmWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Arguments that bind an ALSA-style program to a device in the fixed format
pub fn pcm_args(device: &str) -> Vec<String> {
    vec![
        "-D".to_string(),
        device.to_string(),
        "-c".to_string(),
        CHANNELS.to_string(),
        "-f".to_string(),
        SAMPLE_FORMAT.to_string(),
        "-r".to_string(),
        SAMPLE_RATE.to_string(),
        "-t".to_string(),
        "raw".to_string(),
    ]
}

/// Daemon-local identifier of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a supervised process is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    /// Reads an input device, PCM on stdout
    Capture,
    /// Plays on a local device, PCM on stdin
    Playback,
    /// Sends to a network receiver, PCM on stdin
    Streamer,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessKind::Capture => write!(f, "capture"),
            ProcessKind::Playback => write!(f, "playback"),
            ProcessKind::Streamer => write!(f, "streamer"),
        }
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// The daemon asked for this exit (terminate or handle dropped)
    pub requested: bool,
}

impl ExitInfo {
    pub fn from_status(status: &ExitStatus, requested: bool) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
            requested,
        }
    }

    /// Exited on its own with status 0
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Something a supervised process did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEventKind {
    /// One line of stderr
    Stderr(String),
    /// The process is gone; always the last event for an id
    Exited(ExitInfo),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    pub id: ProcessId,
    pub kind: ProcessEventKind,
}

/// Request sent to a process monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Terminate { graceful: bool },
}

/// Owner's side of a supervised process
///
/// Dropping the handle terminates the process.
pub struct ProcessHandle {
    id: ProcessId,
    kind: ProcessKind,
    device: String,
    pid: Option<u32>,
    stdout: Option<PcmReader>,
    stdin: Option<PcmWriter>,
    control: mpsc::UnboundedSender<Control>,
    monitor: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    /// Create a handle and the control receiver its monitor listens on
    pub fn new(
        id: ProcessId,
        kind: ProcessKind,
        device: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<Control>) {
        let (control, control_rx) = mpsc::unbounded_channel();
        let handle = Self {
            id,
            kind,
            device: device.into(),
            pid: None,
            stdout: None,
            stdin: None,
            control,
            monitor: None,
        };
        (handle, control_rx)
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_stdout(mut self, stdout: PcmReader) -> Self {
        self.stdout = Some(stdout);
        self
    }

    pub fn with_stdin(mut self, stdin: PcmWriter) -> Self {
        self.stdin = Some(stdin);
        self
    }

    pub fn with_monitor(mut self, monitor: JoinHandle<()>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<PcmReader> {
        self.stdout.take()
    }

    pub fn take_stdin(&mut self) -> Option<PcmWriter> {
        self.stdin.take()
    }

    /// Ask the monitor to stop the process
    ///
    /// Graceful termination interrupts first and kills after [`GRACE_PERIOD`].
    /// Completion is reported through the process event channel.
    pub fn terminate(&self, graceful: bool) {
        if self.control.send(Control::Terminate { graceful }).is_err() {
            tracing::debug!("{} {} already exited", self.kind, self.id);
        }
    }

    /// Terminate gracefully and wait for the monitor to finish
    pub async fn shutdown(mut self) {
        self.terminate(true);
        if let Some(monitor) = self.monitor.take() {
            if tokio::time::timeout(Duration::from_secs(1), monitor)
                .await
                .is_err()
            {
                tracing::warn!("{} {} did not stop in time", self.kind, self.id);
            }
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("device", &self.device)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Starts the external programs the daemon relies on
pub trait ProcessLauncher: Send + Sync {
    /// Start capturing from `device`; PCM is available from the handle's stdout
    fn spawn_capture(&self, device: &str) -> Result<ProcessHandle, ProcessError>;

    /// Start playing to `device`; PCM is written to the handle's stdin
    fn spawn_playback(&self, device: &str) -> Result<ProcessHandle, ProcessError>;

    /// Kill every capture process left over from an earlier run that still
    /// holds `device`
    ///
    /// Returns at once. The scan runs in the background and the settle delay
    /// that follows normally covers it; a capture that still finds the device
    /// busy goes through the busy retry.
    fn kill_orphans(&self, device: &str);
}

/// A running process that can be stopped
#[async_trait::async_trait]
pub trait Terminable: Send {
    /// Send the interrupt signal
    fn interrupt(&mut self) -> io::Result<()>;

    /// Kill without waiting
    fn force_kill(&mut self) -> io::Result<()>;

    /// Wait until the process has exited
    async fn wait_exit(&mut self) -> io::Result<ExitStatus>;
}

/// Stop a process, escalating from SIGINT to SIGKILL after [`GRACE_PERIOD`]
pub async fn terminate_with_escalation<T>(process: &mut T, graceful: bool) -> io::Result<ExitStatus>
where
    T: Terminable + ?Sized,
{
    if graceful {
        match process.interrupt() {
            Ok(()) => match tokio::time::timeout(GRACE_PERIOD, process.wait_exit()).await {
                Ok(status) => return status,
                Err(_) => {
                    tracing::debug!(
                        "Process ignored interrupt for {}ms, killing",
                        GRACE_PERIOD.as_millis()
                    );
                }
            },
            Err(e) => tracing::debug!("Interrupt failed ({}), killing", e),
        }
    }

    process.force_kill()?;
    process.wait_exit().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Process that exits on SIGINT only if `obeys_interrupt`
    struct FakeProcess {
        obeys_interrupt: bool,
        interrupted: bool,
        killed: Arc<AtomicUsize>,
    }

    impl FakeProcess {
        fn new(obeys_interrupt: bool) -> Self {
            Self {
                obeys_interrupt,
                interrupted: false,
                killed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait::async_trait]
    impl Terminable for FakeProcess {
        fn interrupt(&mut self) -> io::Result<()> {
            self.interrupted = true;
            Ok(())
        }

        fn force_kill(&mut self) -> io::Result<()> {
            self.killed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn wait_exit(&mut self) -> io::Result<ExitStatus> {
            if self.killed.load(Ordering::SeqCst) > 0 {
                return Ok(ExitStatus::from_raw(9));
            }
            if self.interrupted && self.obeys_interrupt {
                return Ok(ExitStatus::from_raw(2));
            }
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_exit_needs_no_kill() {
        let mut process = FakeProcess::new(true);
        let status = terminate_with_escalation(&mut process, true).await.unwrap();
        assert!(process.interrupted);
        assert_eq!(process.killed.load(Ordering::SeqCst), 0);
        assert_eq!(status.signal(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stubborn_process_is_killed_after_grace_period() {
        let mut process = FakeProcess::new(false);
        let started = tokio::time::Instant::now();
        let status = terminate_with_escalation(&mut process, true).await.unwrap();
        assert!(process.interrupted);
        assert_eq!(process.killed.load(Ordering::SeqCst), 1);
        assert_eq!(status.signal(), Some(9));
        assert!(started.elapsed() >= GRACE_PERIOD);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_termination_skips_interrupt() {
        let mut process = FakeProcess::new(true);
        terminate_with_escalation(&mut process, false).await.unwrap();
        assert!(!process.interrupted);
        assert_eq!(process.killed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pcm_args_use_fixed_format() {
        let args = pcm_args("plughw:1,0");
        assert_eq!(
            args,
            vec!["-D", "plughw:1,0", "-c", "2", "-f", "S16_LE", "-r", "44100", "-t", "raw"]
        );
    }

    #[test]
    fn test_exit_info_display() {
        let info = ExitInfo {
            code: Some(1),
            signal: None,
            requested: false,
        };
        assert_eq!(info.to_string(), "exit code 1");
        assert!(!info.is_clean());

        let info = ExitInfo {
            code: None,
            signal: Some(9),
            requested: true,
        };
        assert_eq!(info.to_string(), "signal 9");
    }

    #[tokio::test]
    async fn test_terminate_sends_control() {
        let (handle, mut rx) = ProcessHandle::new(ProcessId(7), ProcessKind::Capture, "hw:0");
        handle.terminate(true);
        assert_eq!(rx.recv().await, Some(Control::Terminate { graceful: true }));
    }
}

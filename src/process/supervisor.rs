//! tokio-based process supervisor
//!
//! Spawns capture/playback/streamer programs with piped stdio, forwards
//! stderr line by line and reports the exit once stderr is drained, so a
//! "device busy" message always arrives before the exit it caused.

use super::{
    orphans, pcm_args, terminate_with_escalation, Control, ExitInfo, ProcessEvent,
    ProcessEventKind, ProcessHandle, ProcessId, ProcessKind, ProcessLauncher, Terminable,
};
use crate::config::{Config, ProgramConfig};
use crate::error::ProcessError;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// How long the monitor waits for stderr to drain after the process exited
const STDERR_DRAIN: Duration = Duration::from_millis(200);

#[async_trait::async_trait]
impl Terminable for Child {
    fn interrupt(&mut self) -> io::Result<()> {
        let pid = self
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "process already reaped"))?;
        kill(Pid::from_raw(pid as i32), Signal::SIGINT).map_err(io::Error::from)
    }

    fn force_kill(&mut self) -> io::Result<()> {
        self.start_kill()
    }

    async fn wait_exit(&mut self) -> io::Result<ExitStatus> {
        self.wait().await
    }
}

/// Spawns and monitors external PCM programs
pub struct Supervisor {
    capture: ProgramConfig,
    playback: ProgramConfig,
    proc_root: PathBuf,
    events: mpsc::UnboundedSender<ProcessEvent>,
    next_id: AtomicU64,
    /// PIDs of processes this supervisor is monitoring
    live: Arc<Mutex<HashSet<u32>>>,
}

impl Supervisor {
    pub fn new(config: &Config, events: mpsc::UnboundedSender<ProcessEvent>) -> Self {
        Self {
            capture: config.capture.clone(),
            playback: config.playback.clone(),
            proc_root: PathBuf::from("/proc"),
            events,
            next_id: AtomicU64::new(1),
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Spawn `cmd` under supervision
    ///
    /// Capture processes get a piped stdout, everything else a piped stdin.
    pub fn spawn(
        &self,
        kind: ProcessKind,
        device: &str,
        mut cmd: Command,
    ) -> Result<ProcessHandle, ProcessError> {
        let program = cmd.as_std().get_program().to_string_lossy().into_owned();

        match kind {
            ProcessKind::Capture => cmd.stdin(Stdio::null()).stdout(Stdio::piped()),
            ProcessKind::Playback | ProcessKind::Streamer => {
                cmd.stdin(Stdio::piped()).stdout(Stdio::null())
            }
        };
        cmd.stderr(Stdio::piped()).kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ProcessError::Spawn {
            program: program.clone(),
            device: device.to_string(),
            reason: e.to_string(),
        })?;

        let id = ProcessId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let pid = child.id();
        tracing::debug!("Started {} {} ({} on {}, pid {:?})", kind, id, program, device, pid);

        let (mut handle, control_rx) = ProcessHandle::new(id, kind, device);
        handle = handle.with_pid(pid);
        if let Some(stdout) = child.stdout.take() {
            handle = handle.with_stdout(Box::new(stdout));
        }
        if let Some(stdin) = child.stdin.take() {
            handle = handle.with_stdin(Box::new(stdin));
        }

        let stderr_task = child.stderr.take().map(|stderr| {
            let events = self.events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::trace!("{} stderr: {}", id, line);
                    if events
                        .send(ProcessEvent {
                            id,
                            kind: ProcessEventKind::Stderr(line),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            })
        });

        if let Some(pid) = pid {
            if let Ok(mut live) = self.live.lock() {
                live.insert(pid);
            }
        }

        let monitor = tokio::spawn(monitor(
            id,
            kind,
            pid,
            child,
            control_rx,
            stderr_task,
            self.events.clone(),
            Arc::clone(&self.live),
        ));

        Ok(handle.with_monitor(monitor))
    }

    fn program_command(program: &ProgramConfig, device: &str) -> Command {
        let mut cmd = Command::new(&program.program);
        cmd.args(pcm_args(device)).args(&program.extra_args);
        cmd
    }

    /// Capture processes holding `device` that this supervisor does not own
    pub fn find_orphans(&self, device: &str) -> Vec<u32> {
        find_unsupervised(&self.proc_root, &self.capture.program, device, &self.live)
    }
}

fn supervised(live: &Mutex<HashSet<u32>>) -> HashSet<u32> {
    live.lock().map(|live| live.clone()).unwrap_or_default()
}

fn find_unsupervised(
    proc_root: &Path,
    program: &str,
    device: &str,
    live: &Mutex<HashSet<u32>>,
) -> Vec<u32> {
    let pids = orphans::scan(proc_root, program, device);
    // Read after the scan so a capture spawned meanwhile is still ours
    let ours = supervised(live);
    pids.into_iter().filter(|pid| !ours.contains(pid)).collect()
}

fn kill_pids(pids: &[u32], device: &str) -> usize {
    let mut killed = 0;
    for &pid in pids {
        match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => {
                tracing::info!("Killed leftover capture process {} holding {}", pid, device);
                killed += 1;
            }
            Err(e) => {
                tracing::warn!("Cannot kill leftover capture process {}: {}", pid, e);
            }
        }
    }
    killed
}

#[allow(clippy::too_many_arguments)]
async fn monitor(
    id: ProcessId,
    kind: ProcessKind,
    pid: Option<u32>,
    mut child: Child,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    live: Arc<Mutex<HashSet<u32>>>,
) {
    let (status, requested) = tokio::select! {
        status = child.wait() => (status, false),
        control = control_rx.recv() => {
            // A dropped handle counts as a graceful terminate
            let graceful = match control {
                Some(Control::Terminate { graceful }) => graceful,
                None => true,
            };
            (terminate_with_escalation(&mut child, graceful).await, true)
        }
    };

    if let Some(mut task) = stderr_task {
        if tokio::time::timeout(STDERR_DRAIN, &mut task).await.is_err() {
            // A grandchild may hold the pipe; nothing may follow the exit event
            tracing::debug!("{} stderr still open after exit, dropping it", id);
            task.abort();
        }
    }

    if let Some(pid) = pid {
        if let Ok(mut live) = live.lock() {
            live.remove(&pid);
        }
    }

    let info = match status {
        Ok(status) => ExitInfo::from_status(&status, requested),
        Err(e) => {
            tracing::warn!("Failed to wait for {} {}: {}", kind, id, e);
            ExitInfo {
                code: None,
                signal: None,
                requested,
            }
        }
    };

    if requested {
        tracing::debug!("{} {} stopped ({})", kind, id, info);
    } else {
        tracing::info!("{} {} exited ({})", kind, id, info);
    }

    let _ = events.send(ProcessEvent {
        id,
        kind: ProcessEventKind::Exited(info),
    });
}

impl ProcessLauncher for Supervisor {
    fn spawn_capture(&self, device: &str) -> Result<ProcessHandle, ProcessError> {
        let cmd = Self::program_command(&self.capture, device);
        let mut handle = self.spawn(ProcessKind::Capture, device, cmd)?;
        // Put the pipe back after checking it exists
        let stdout = handle
            .take_stdout()
            .ok_or(ProcessError::MissingPipe(handle.pid().unwrap_or(0), "stdout"))?;
        Ok(handle.with_stdout(stdout))
    }

    fn spawn_playback(&self, device: &str) -> Result<ProcessHandle, ProcessError> {
        let cmd = Self::program_command(&self.playback, device);
        let mut handle = self.spawn(ProcessKind::Playback, device, cmd)?;
        let stdin = handle
            .take_stdin()
            .ok_or(ProcessError::MissingPipe(handle.pid().unwrap_or(0), "stdin"))?;
        Ok(handle.with_stdin(stdin))
    }

    fn kill_orphans(&self, device: &str) {
        let proc_root = self.proc_root.clone();
        let program = self.capture.program.clone();
        let device = device.to_string();
        let live = Arc::clone(&self.live);

        // Walking /proc blocks, keep it off the event loop
        tokio::task::spawn_blocking(move || {
            let pids = find_unsupervised(&proc_root, &program, &device, &live);
            let killed = kill_pids(&pids, &device);
            if killed > 0 {
                tracing::info!("Cleared {} leftover capture(s) on '{}'", killed, device);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> (Supervisor, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Supervisor::new(&Config::default(), tx), rx)
    }

    async fn next_exit(rx: &mut mpsc::UnboundedReceiver<ProcessEvent>) -> (ProcessId, ExitInfo, Vec<String>) {
        let mut lines = Vec::new();
        while let Some(event) = rx.recv().await {
            match event.kind {
                ProcessEventKind::Stderr(line) => lines.push(line),
                ProcessEventKind::Exited(info) => return (event.id, info, lines),
            }
        }
        panic!("event channel closed");
    }

    /// A /proc lookalike; command lines are given space separated
    fn fake_proc(entries: &[(u32, &str)]) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        for (pid, cmdline) in entries {
            let dir = root.path().join(pid.to_string());
            std::fs::create_dir(&dir).unwrap();
            let raw: String = cmdline.split(' ').map(|arg| format!("{}\0", arg)).collect();
            std::fs::write(dir.join("cmdline"), raw).unwrap();
        }
        root
    }

    #[test]
    fn test_find_orphans_skips_supervised_captures() {
        let root = fake_proc(&[
            (101, "arecord -D plughw:1,0 -t raw"),
            (102, "/usr/bin/arecord --device=plughw:1,0"),
            (103, "arecord -D plughw:2,0"),
            (104, "aplay -D plughw:1,0"),
        ]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sup = Supervisor::new(&Config::default(), tx);
        sup.proc_root = root.path().to_path_buf();
        sup.live.lock().unwrap().insert(102);

        assert_eq!(sup.find_orphans("plughw:1,0"), vec![101]);
    }

    #[test]
    fn test_kill_of_vanished_pid_is_not_counted() {
        // Above the kernel's pid_max, so it never exists
        assert_eq!(kill_pids(&[4_194_999], "plughw:1,0"), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_synchronously() {
        let (sup, _rx) = supervisor();
        let result = sup.spawn(
            ProcessKind::Playback,
            "hw:9",
            Command::new("/nonexistent/pcmcast-test-program"),
        );
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_stderr_arrives_before_exit() {
        let (sup, mut rx) = supervisor();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo 'audio open error: Device or resource busy' >&2; exit 1"]);
        let handle = sup.spawn(ProcessKind::Capture, "hw:0", cmd).unwrap();

        let (id, info, lines) = next_exit(&mut rx).await;
        assert_eq!(id, handle.id());
        assert_eq!(info.code, Some(1));
        assert!(!info.requested);
        assert_eq!(lines, vec!["audio open error: Device or resource busy"]);
    }

    #[tokio::test]
    async fn test_terminate_is_reported_as_requested() {
        let (sup, mut rx) = supervisor();
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let handle = sup.spawn(ProcessKind::Playback, "hw:0", cmd).unwrap();
        assert!(handle.pid().is_some());

        handle.terminate(true);
        let (_, info, _) = next_exit(&mut rx).await;
        assert!(info.requested);
        assert!(supervised(&sup.live).is_empty());
    }

    #[tokio::test]
    async fn test_exit_is_last_even_with_stderr_held_open() {
        let (sup, mut rx) = supervisor();
        let mut cmd = Command::new("sh");
        // The background job keeps stderr open past the exit
        cmd.args(["-c", "(sleep 0.5; echo late >&2) & exit 3"]);
        let handle = sup.spawn(ProcessKind::Capture, "hw:0", cmd).unwrap();

        let (id, info, _) = next_exit(&mut rx).await;
        assert_eq!(id, handle.id());
        assert_eq!(info.code, Some(3));

        let after = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(after.is_err(), "event after exit: {:?}", after);
    }

    #[tokio::test]
    async fn test_capture_exposes_stdout() {
        let (sup, mut rx) = supervisor();
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf abcd"]);
        let mut handle = sup.spawn(ProcessKind::Capture, "hw:0", cmd).unwrap();

        let mut stdout = handle.take_stdout().unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, b"abcd");

        let (_, info, _) = next_exit(&mut rx).await;
        assert!(info.is_clean());
    }
}

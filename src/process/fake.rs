//! In-memory process launcher for tests

use super::{Control, ProcessHandle, ProcessId, ProcessKind, ProcessLauncher};
use crate::error::ProcessError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TryRecvError};

#[derive(Default)]
struct State {
    next_id: u64,
    spawned: Vec<(ProcessKind, String, ProcessId)>,
    failing: HashSet<String>,
    orphan_kills: Vec<String>,
    controls: HashMap<ProcessId, mpsc::UnboundedReceiver<Control>>,
}

/// Launcher whose processes are plain handles with in-memory pipes
#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<State>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Make every spawn for `device` fail
    pub fn fail_device(&self, device: &str) {
        self.state().failing.insert(device.to_string());
    }

    pub fn spawned(&self) -> Vec<(ProcessKind, String, ProcessId)> {
        self.state().spawned.clone()
    }

    pub fn spawned_ids(&self, kind: ProcessKind) -> Vec<ProcessId> {
        self.state()
            .spawned
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, id)| *id)
            .collect()
    }

    pub fn orphan_kills(&self) -> Vec<String> {
        self.state().orphan_kills.clone()
    }

    /// Whether the owner asked the process to stop or dropped its handle
    pub fn was_terminated(&self, id: ProcessId) -> bool {
        match self.state().controls.get_mut(&id) {
            Some(rx) => !matches!(rx.try_recv(), Err(TryRecvError::Empty)),
            None => false,
        }
    }

    fn spawn(&self, kind: ProcessKind, device: &str) -> Result<ProcessHandle, ProcessError> {
        let mut state = self.state();
        if state.failing.contains(device) {
            return Err(ProcessError::Spawn {
                program: "fake".to_string(),
                device: device.to_string(),
                reason: "No such file or directory".to_string(),
            });
        }
        state.next_id += 1;
        let id = ProcessId(state.next_id);
        let (handle, control_rx) = ProcessHandle::new(id, kind, device);
        state.controls.insert(id, control_rx);
        state.spawned.push((kind, device.to_string(), id));
        Ok(handle.with_pid(Some(10_000 + id.0 as u32)))
    }
}

impl ProcessLauncher for FakeLauncher {
    fn spawn_capture(&self, device: &str) -> Result<ProcessHandle, ProcessError> {
        let handle = self.spawn(ProcessKind::Capture, device)?;
        Ok(handle.with_stdout(Box::new(tokio::io::empty())))
    }

    fn spawn_playback(&self, device: &str) -> Result<ProcessHandle, ProcessError> {
        let handle = self.spawn(ProcessKind::Playback, device)?;
        Ok(handle.with_stdin(Box::new(tokio::io::sink())))
    }

    fn kill_orphans(&self, device: &str) {
        self.state().orphan_kills.push(device.to_string());
    }
}

//! Output registry
//!
//! Tracks which outputs are active and owns every sink handle behind them.
//! An output selected on the control surface may stand for several physical
//! sinks (a stereo pair), so each [`ActiveOutput`] holds one handle per member:
//!
//! - local members: a playback process whose stdin is fed by the duplicator
//! - streaming members: a streaming session whose input is fed by the duplicator
//!
//! Outputs live and die as a unit. If one member cannot start or later fails,
//! the whole output is torn down.

pub mod duplicator;
pub mod streaming;

use crate::catalog::{Catalog, OutputMember, UnifiedOutput, NULL_OUTPUT_ID};
use crate::error::SinkError;
use crate::process::{ExitInfo, ProcessHandle, ProcessId, ProcessLauncher};
use duplicator::{Duplicator, SinkId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use streaming::{StreamOptions, StreamingProvider, StreamingSession};

/// Highest volume value
pub const MAX_VOLUME: u8 = 100;

/// Clamp any integer into the volume range
pub fn clamp_volume(value: i64) -> u8 {
    value.clamp(0, MAX_VOLUME as i64) as u8
}

/// One running member of an active output
pub enum SinkHandle {
    Local {
        process: ProcessHandle,
        sink: Option<SinkId>,
    },
    Streaming {
        host: String,
        port: u16,
        session: Box<dyn StreamingSession>,
        sink: Option<SinkId>,
    },
}

impl SinkHandle {
    fn sink(&self) -> Option<SinkId> {
        match self {
            SinkHandle::Local { sink, .. } | SinkHandle::Streaming { sink, .. } => *sink,
        }
    }

    fn process(&self) -> Option<ProcessId> {
        match self {
            SinkHandle::Local { process, .. } => Some(process.id()),
            SinkHandle::Streaming { session, .. } => session.process(),
        }
    }

    fn label(&self) -> String {
        match self {
            SinkHandle::Local { process, .. } => process.device().to_string(),
            SinkHandle::Streaming { host, port, .. } => format!("{}:{}", host, port),
        }
    }
}

/// An output currently receiving audio
pub struct ActiveOutput {
    pub ui_id: String,
    pub handles: Vec<SinkHandle>,
}

/// What a [`OutputRegistry::sync`] call did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub removed: Vec<String>,
    pub added: Vec<String>,
    /// Not in the catalog any more
    pub missing: Vec<String>,
    /// Outputs that could not be started, with the reason
    pub failed: Vec<(String, String)>,
}

impl SyncReport {
    /// Whether the active set changed
    pub fn changed(&self) -> bool {
        !self.removed.is_empty() || !self.added.is_empty()
    }
}

/// An output torn down because one of its sinks failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostOutput {
    pub ui_id: String,
    pub reason: String,
}

pub struct OutputRegistry {
    active: BTreeMap<String, ActiveOutput>,
    duplicator: Duplicator,
    launcher: Arc<dyn ProcessLauncher>,
    streamer: Arc<dyn StreamingProvider>,
    volume: u8,
}

impl OutputRegistry {
    pub fn new(
        duplicator: Duplicator,
        launcher: Arc<dyn ProcessLauncher>,
        streamer: Arc<dyn StreamingProvider>,
        volume: u8,
    ) -> Self {
        Self {
            active: BTreeMap::new(),
            duplicator,
            launcher,
            streamer,
            volume: volume.min(MAX_VOLUME),
        }
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    pub fn is_active(&self, ui_id: &str) -> bool {
        self.active.contains_key(ui_id)
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    /// Make the active set equal to `desired`
    ///
    /// Removals all happen before additions. Ids that are no longer in the
    /// catalog are skipped. An output that fails to start is reported and left
    /// inactive without affecting the others.
    pub fn sync<I, S>(&mut self, desired: I, catalog: &Catalog) -> SyncReport
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let desired: BTreeSet<String> = desired.into_iter().map(Into::into).collect();
        let mut report = SyncReport::default();

        let removed: Vec<String> = self
            .active
            .keys()
            .filter(|id| !desired.contains(*id))
            .cloned()
            .collect();
        for ui_id in removed {
            if let Some(output) = self.active.remove(&ui_id) {
                tracing::info!("Stopping output {}", ui_id);
                self.teardown(output);
            }
            report.removed.push(ui_id);
        }

        for ui_id in desired {
            if ui_id == NULL_OUTPUT_ID || self.active.contains_key(&ui_id) {
                continue;
            }
            let Some(output) = catalog.find_output(&ui_id) else {
                tracing::debug!("Output {} is gone from the catalog, skipping", ui_id);
                report.missing.push(ui_id);
                continue;
            };

            match self.start(&output) {
                Ok(active) => {
                    tracing::info!("Started output {} ({})", ui_id, output.display_name);
                    self.active.insert(ui_id.clone(), active);
                    report.added.push(ui_id);
                }
                Err(e) => {
                    tracing::error!("Output {} failed to start: {}", ui_id, e);
                    report.failed.push((ui_id, e.to_string()));
                }
            }
        }

        self.apply_volume();
        report
    }

    /// Set the volume of every streaming receiver, returning the applied value
    pub fn set_volume(&mut self, value: i64) -> u8 {
        self.volume = clamp_volume(value);
        self.apply_volume();
        self.volume
    }

    /// A supervised process exited; tears down the output it belonged to
    pub fn on_process_exit(&mut self, id: ProcessId, info: ExitInfo) -> Option<LostOutput> {
        if info.requested {
            return None;
        }
        let ui_id = self
            .active
            .iter()
            .find(|(_, o)| o.handles.iter().any(|h| h.process() == Some(id)))
            .map(|(ui_id, _)| ui_id.clone())?;
        self.lose(ui_id, format!("sink process exited ({})", info))
    }

    /// Writing to a sink failed
    pub fn on_sink_failed(&mut self, sink: SinkId, error: &str) -> Option<LostOutput> {
        let ui_id = self
            .active
            .iter()
            .find(|(_, o)| o.handles.iter().any(|h| h.sink() == Some(sink)))
            .map(|(ui_id, _)| ui_id.clone())?;
        self.lose(ui_id, format!("write failed: {}", error))
    }

    /// Stop every output
    pub async fn shutdown(&mut self) {
        let outputs = std::mem::take(&mut self.active);
        for (ui_id, output) in outputs {
            tracing::debug!("Shutting down output {}", ui_id);
            for handle in output.handles {
                match handle {
                    SinkHandle::Local { process, sink } => {
                        if let Some(sink) = sink {
                            self.duplicator.detach_sink(sink);
                        }
                        process.shutdown().await;
                    }
                    SinkHandle::Streaming {
                        host,
                        port,
                        mut session,
                        sink,
                    } => {
                        if let Some(sink) = sink {
                            self.duplicator.detach_sink(sink);
                        }
                        if let Err(e) = session.stop() {
                            tracing::warn!("Stopping {}:{} failed: {}", host, port, e);
                        }
                    }
                }
            }
        }
    }

    fn lose(&mut self, ui_id: String, reason: String) -> Option<LostOutput> {
        let output = self.active.remove(&ui_id)?;
        tracing::warn!("Output {} lost: {}", ui_id, reason);
        self.teardown(output);
        Some(LostOutput { ui_id, reason })
    }

    fn start(&self, output: &UnifiedOutput) -> Result<ActiveOutput, SinkError> {
        let mut handles = Vec::with_capacity(output.members.len());
        for member in &output.members {
            match self.start_member(member, output.is_stereo) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Members already running go down with the output
                    self.teardown(ActiveOutput {
                        ui_id: output.ui_id.clone(),
                        handles,
                    });
                    return Err(e);
                }
            }
        }
        Ok(ActiveOutput {
            ui_id: output.ui_id.clone(),
            handles,
        })
    }

    fn start_member(&self, member: &OutputMember, stereo: bool) -> Result<SinkHandle, SinkError> {
        match member {
            OutputMember::Local { sink_id } => {
                let mut process =
                    self.launcher
                        .spawn_playback(sink_id)
                        .map_err(|e| SinkError::Attach {
                            target: sink_id.clone(),
                            reason: e.to_string(),
                        })?;
                let sink = process
                    .take_stdin()
                    .map(|stdin| self.duplicator.attach_sink(sink_id, stdin));
                Ok(SinkHandle::Local { process, sink })
            }
            OutputMember::Streaming { host, port } => {
                let opts = StreamOptions {
                    volume: self.volume,
                    stereo,
                };
                let mut session = self.streamer.add(host, *port, opts)?;
                let label = format!("{}:{}", host, port);
                let sink = session
                    .take_input()
                    .map(|input| self.duplicator.attach_sink(&label, input));
                Ok(SinkHandle::Streaming {
                    host: host.clone(),
                    port: *port,
                    session,
                    sink,
                })
            }
        }
    }

    fn teardown(&self, output: ActiveOutput) {
        for handle in output.handles {
            let label = handle.label();
            if let Some(sink) = handle.sink() {
                self.duplicator.detach_sink(sink);
            }
            match handle {
                SinkHandle::Local { process, .. } => process.terminate(true),
                SinkHandle::Streaming { mut session, .. } => {
                    if let Err(e) = session.stop() {
                        tracing::warn!("Stopping {} failed: {}", label, e);
                    }
                }
            }
        }
    }

    fn apply_volume(&mut self) {
        let volume = self.volume;
        for output in self.active.values_mut() {
            for handle in &mut output.handles {
                if let SinkHandle::Streaming {
                    host, port, session, ..
                } = handle
                {
                    if let Err(e) = session.set_volume(volume) {
                        tracing::warn!("Volume for {}:{} not applied: {}", host, port, e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::streaming::fake::FakeStreamer;
    use super::*;
    use crate::catalog::alsa::LocalPcm;
    use crate::catalog::{StreamingAnnouncement, GROUP_TXT_KEY};
    use crate::process::fake::FakeLauncher;
    use crate::process::ProcessKind;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    struct Harness {
        registry: OutputRegistry,
        catalog: Catalog,
        launcher: FakeLauncher,
        streamer: FakeStreamer,
        duplicator: Duplicator,
    }

    fn receiver(catalog: &mut Catalog, name: &str, host: &str, group: Option<&str>) {
        let mut txt = HashMap::new();
        if let Some(group) = group {
            txt.insert(GROUP_TXT_KEY.to_string(), group.to_string());
        }
        catalog.on_streaming_up(StreamingAnnouncement {
            name: name.to_string(),
            addresses: vec![host.to_string()],
            port: 7000,
            txt,
        });
    }

    impl Harness {
        fn new() -> Self {
            let launcher = FakeLauncher::new();
            let streamer = FakeStreamer::default();
            let (tx, _rx) = mpsc::unbounded_channel();
            let duplicator = Duplicator::new(tx);
            let registry = OutputRegistry::new(
                duplicator.clone(),
                Arc::new(launcher.clone()),
                Arc::new(streamer.clone()),
                50,
            );

            let mut catalog = Catalog::new("/nonexistent");
            catalog.replace_local(vec![LocalPcm {
                id: "plughw:1,0".to_string(),
                name: "USB Audio".to_string(),
                playback: true,
                capture: false,
            }]);
            receiver(&mut catalog, "Kitchen", "10.0.0.1", None);
            receiver(&mut catalog, "Left", "10.0.0.2", Some("Living"));
            receiver(&mut catalog, "Right", "10.0.0.3", Some("Living"));

            Self {
                registry,
                catalog,
                launcher,
                streamer,
                duplicator,
            }
        }

        fn sync(&mut self, ids: &[&str]) -> SyncReport {
            self.registry.sync(ids.iter().copied(), &self.catalog)
        }
    }

    #[test]
    fn test_clamp_volume() {
        assert_eq!(clamp_volume(-5), 0);
        assert_eq!(clamp_volume(42), 42);
        assert_eq!(clamp_volume(250), 100);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let mut h = Harness::new();
        let first = h.sync(&["local:plughw:1,0", "stream:10.0.0.1:7000"]);
        assert_eq!(first.added.len(), 2);
        assert_eq!(h.duplicator.sink_count(), 2);

        let second = h.sync(&["stream:10.0.0.1:7000", "local:plughw:1,0"]);
        assert!(!second.changed());
        assert_eq!(h.launcher.spawned_ids(ProcessKind::Playback).len(), 1);
        assert_eq!(h.streamer.added().len(), 1);
        assert_eq!(h.duplicator.sink_count(), 2);
    }

    #[tokio::test]
    async fn test_removals_precede_additions() {
        let mut h = Harness::new();
        h.sync(&["stream:10.0.0.1:7000"]);
        let report = h.sync(&["stream:Living"]);

        assert_eq!(report.removed, vec!["stream:10.0.0.1:7000"]);
        assert_eq!(report.added, vec!["stream:Living"]);
        assert_eq!(
            h.streamer.sequence(),
            vec!["add 10.0.0.1", "stop 10.0.0.1", "add 10.0.0.2", "add 10.0.0.3"]
        );
    }

    #[tokio::test]
    async fn test_stereo_members_start_together() {
        let mut h = Harness::new();
        h.sync(&["stream:Living"]);
        let added = h.streamer.added();
        assert_eq!(added.len(), 2);
        assert!(added.iter().all(|(_, _, opts)| opts.stereo && opts.volume == 50));
        assert_eq!(h.duplicator.sink_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_and_null_ids_are_skipped() {
        let mut h = Harness::new();
        let report = h.sync(&["stream:gone:1", NULL_OUTPUT_ID]);
        assert_eq!(report.missing, vec!["stream:gone:1"]);
        assert!(report.failed.is_empty());
        assert!(h.registry.active_ids().is_empty());
        assert!(h.streamer.added().is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_other_outputs() {
        let mut h = Harness::new();
        h.streamer.fail_host("10.0.0.3");
        let report = h.sync(&["stream:Living", "stream:10.0.0.1:7000"]);

        assert_eq!(report.added, vec!["stream:10.0.0.1:7000"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "stream:Living");
        assert!(!h.registry.is_active("stream:Living"));
        // The left speaker that did start was stopped again
        assert_eq!(h.streamer.stopped(), vec![("10.0.0.2".to_string(), 7000)]);
        assert_eq!(h.duplicator.sink_count(), 1);
    }

    #[tokio::test]
    async fn test_local_failure_is_reported() {
        let mut h = Harness::new();
        h.launcher.fail_device("plughw:1,0");
        let report = h.sync(&["local:plughw:1,0"]);
        assert_eq!(report.failed.len(), 1);
        assert!(h.registry.active_ids().is_empty());
    }

    #[tokio::test]
    async fn test_volume_is_clamped_and_applied() {
        let mut h = Harness::new();
        h.sync(&["stream:10.0.0.1:7000", "local:plughw:1,0"]);
        assert_eq!(h.registry.set_volume(140), 100);
        assert_eq!(h.registry.set_volume(-3), 0);

        let volumes: Vec<u8> = h.streamer.volumes().into_iter().map(|(_, _, v)| v).collect();
        // Once after sync, then for each set_volume
        assert_eq!(volumes, vec![50, 100, 0]);
        assert_eq!(h.registry.volume(), 0);
    }

    #[tokio::test]
    async fn test_removed_local_output_terminates_playback() {
        let mut h = Harness::new();
        h.sync(&["local:plughw:1,0"]);
        let id = h.launcher.spawned_ids(ProcessKind::Playback)[0];
        h.sync(Vec::<&str>::new().as_slice());
        assert!(h.launcher.was_terminated(id));
        assert_eq!(h.duplicator.sink_count(), 0);
    }

    #[tokio::test]
    async fn test_playback_crash_destroys_output() {
        let mut h = Harness::new();
        h.sync(&["local:plughw:1,0"]);
        let id = h.launcher.spawned_ids(ProcessKind::Playback)[0];

        let requested = ExitInfo {
            code: Some(0),
            signal: None,
            requested: true,
        };
        assert!(h.registry.on_process_exit(id, requested).is_none());

        let crashed = ExitInfo {
            code: Some(1),
            signal: None,
            requested: false,
        };
        let lost = h.registry.on_process_exit(id, crashed).unwrap();
        assert_eq!(lost.ui_id, "local:plughw:1,0");
        assert!(h.registry.active_ids().is_empty());
        assert_eq!(h.duplicator.sink_count(), 0);
    }

    #[tokio::test]
    async fn test_sink_failure_destroys_whole_output() {
        let mut h = Harness::new();
        h.sync(&["stream:Living"]);
        assert_eq!(h.duplicator.sink_count(), 2);

        // Sink ids are handed out in attach order
        let lost = h.registry.on_sink_failed(SinkId(2), "broken pipe").unwrap();
        assert_eq!(lost.ui_id, "stream:Living");
        assert_eq!(h.streamer.stopped().len(), 2);
        assert_eq!(h.duplicator.sink_count(), 0);
        assert!(h.registry.on_sink_failed(SinkId(2), "broken pipe").is_none());
    }
}

//! Command dispatch and state ownership
//!
//! The switchboard owns every piece of mutable daemon state: the owner gate,
//! the device catalog, the input session and the output registry. The daemon
//! loop feeds it one event at a time, so nothing here needs locking.
//!
//! Mutating commands from connections that are not the owner are dropped
//! without a reply.

use crate::catalog::bluetooth::BluetoothDevice;
use crate::catalog::{Catalog, StreamingEvent};
use crate::control::{coerce_volume, ControlCommand, ControlEvent, ControlRequest, Notifier};
use crate::gate::{ConnectionId, OwnerChange, OwnerGate};
use crate::input::{InputManager, InputNotice, InputTimer};
use crate::output::duplicator::DuplicatorEvent;
use crate::output::OutputRegistry;
use crate::process::{ProcessEvent, ProcessEventKind};
use std::panic::{self, AssertUnwindSafe};

pub struct Switchboard {
    gate: OwnerGate,
    catalog: Catalog,
    input: InputManager,
    outputs: OutputRegistry,
    notifier: Notifier,
}

impl Switchboard {
    pub fn new(
        gate: OwnerGate,
        catalog: Catalog,
        input: InputManager,
        outputs: OutputRegistry,
        notifier: Notifier,
    ) -> Self {
        Self {
            gate,
            catalog,
            input,
            outputs,
            notifier,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn input(&self) -> &InputManager {
        &self.input
    }

    pub fn outputs(&self) -> &OutputRegistry {
        &self.outputs
    }

    pub fn gate(&self) -> &OwnerGate {
        &self.gate
    }

    /// Run one handler; a panic inside it is logged and reported as a
    /// generic error notice instead of taking the daemon down
    pub fn guarded<F>(&mut self, what: &str, handler: F)
    where
        F: FnOnce(&mut Self),
    {
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(self)));
        if let Err(payload) = result {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown cause".to_string());
            tracing::error!("Handling {} failed: {}", what, detail);
            self.notifier
                .error("Internal error while handling a request, see the daemon log");
        }
    }

    pub fn handle_request(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Connected(conn) => self.on_connect(conn),
            ControlRequest::Disconnected(conn) => self.on_disconnect(conn),
            ControlRequest::Command(conn, command) => self.handle_command(conn, command),
        }
    }

    pub fn on_connect(&mut self, conn: ConnectionId) {
        let change = self.gate.connect(conn);
        self.notifier
            .send_to(conn, ControlEvent::Hello { connection_id: conn });
        self.notifier.send_to(conn, self.snapshot(conn));
        self.announce_owner(change);
    }

    pub fn on_disconnect(&mut self, conn: ConnectionId) {
        let change = self.gate.disconnect(conn);
        self.announce_owner(change);
    }

    pub fn handle_command(&mut self, conn: ConnectionId, command: ControlCommand) {
        if matches!(command, ControlCommand::TakeoverControl) {
            let change = self.gate.takeover(conn);
            self.announce_owner(change);
            return;
        }
        if !self.gate.is_owner(conn) {
            tracing::debug!("Ignoring {:?} from {}, not the owner", command, conn);
            return;
        }

        match command {
            ControlCommand::SwitchInput { id } => {
                let notices = self.input.switch_input(&id);
                self.publish_input(notices);
            }
            ControlCommand::SyncOutputs { ids } => {
                let report = self.outputs.sync(ids, &self.catalog);
                for (ui_id, reason) in &report.failed {
                    self.notifier
                        .error(format!("Output {} could not be started: {}", ui_id, reason));
                }
                self.publish_outputs();
            }
            ControlCommand::SetVolume { value } => match coerce_volume(&value) {
                Some(value) => {
                    let applied = self.outputs.set_volume(value);
                    self.notifier
                        .publish(ControlEvent::VolumeChanged { value: applied });
                }
                None => tracing::warn!("Ignoring non-numeric volume {}", value),
            },
            ControlCommand::TakeoverControl => {}
        }
    }

    pub fn on_process_event(&mut self, event: ProcessEvent) {
        let notices = self.input.on_process_event(&event);
        self.publish_input(notices);

        if let ProcessEventKind::Exited(info) = event.kind {
            if let Some(lost) = self.outputs.on_process_exit(event.id, info) {
                self.notifier
                    .error(format!("Output {} stopped: {}", lost.ui_id, lost.reason));
                self.publish_outputs();
            }
        }
    }

    pub fn on_duplicator_event(&mut self, event: DuplicatorEvent) {
        match event {
            DuplicatorEvent::SourceFlowing(tag) => {
                let notices = self.input.on_source_flowing(tag);
                self.publish_input(notices);
            }
            // The capture's exit event follows and decides what happens
            DuplicatorEvent::SourceEnded(tag) => tracing::debug!("Source {} ended", tag),
            DuplicatorEvent::SinkFailed { sink, error } => {
                if let Some(lost) = self.outputs.on_sink_failed(sink, &error) {
                    self.notifier
                        .error(format!("Output {} stopped: {}", lost.ui_id, lost.reason));
                    self.publish_outputs();
                }
            }
        }
    }

    pub fn on_timer(&mut self, timer: InputTimer) {
        let notices = self.input.on_timer(timer);
        self.publish_input(notices);
    }

    pub fn on_streaming_event(&mut self, event: StreamingEvent) {
        if self.catalog.on_streaming_event(event) {
            self.publish_output_list();
        }
    }

    pub fn on_bluetooth_devices(&mut self, devices: Vec<BluetoothDevice>) {
        if self.catalog.on_bluetooth_devices_changed(devices) {
            self.publish_input_list();
        }
    }

    /// Re-read local devices and announce any change
    pub async fn rescan_local(&mut self) {
        match self.catalog.rescan_local().await {
            Ok(true) => {
                self.publish_input_list();
                self.publish_output_list();
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(
                "Cannot read local devices from {:?}: {}",
                self.catalog.pcm_list(),
                e
            ),
        }
    }

    /// Full state as seen by `conn`
    pub fn snapshot(&self, conn: ConnectionId) -> ControlEvent {
        ControlEvent::Snapshot {
            inputs: self.catalog.inputs(),
            outputs: self.catalog.unified_outputs(),
            current_input: self.input.current_input().to_string(),
            active_outputs: self.outputs.active_ids(),
            volume: self.outputs.volume(),
            is_owner: self.gate.is_owner(conn),
        }
    }

    /// Stop capture and every output
    pub async fn shutdown(&mut self) {
        tracing::info!("Stopping capture and outputs");
        self.input.shutdown().await;
        self.outputs.shutdown().await;
    }

    fn announce_owner(&self, change: OwnerChange) {
        if let Some(displaced) = change.displaced {
            self.notifier.send_to(displaced, ControlEvent::LostControl);
        }
        if change.changed {
            self.notifier
                .publish(ControlEvent::OwnerChanged { owner: change.owner });
        }
    }

    fn publish_input(&self, notices: Vec<InputNotice>) {
        for notice in notices {
            match notice {
                InputNotice::Changed(id) => self.notifier.publish(ControlEvent::InputChanged { id }),
                InputNotice::Status(message) => self.notifier.status(message),
                InputNotice::Error(message) => self.notifier.error(message),
            }
        }
    }

    fn publish_outputs(&self) {
        self.notifier.publish(ControlEvent::OutputsChanged {
            ids: self.outputs.active_ids(),
        });
    }

    fn publish_input_list(&self) {
        self.notifier.publish(ControlEvent::InputListChanged {
            inputs: self.catalog.inputs(),
        });
    }

    fn publish_output_list(&self) {
        self.notifier.publish(ControlEvent::OutputListChanged {
            outputs: self.catalog.unified_outputs(),
        });
    }
}

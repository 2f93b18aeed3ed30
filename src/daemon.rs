//! Daemon module - main event loop orchestration
//!
//! Wires the supervisor, duplicator, input session, output registry and
//! control server together and feeds every event into the switchboard from a
//! single loop, so state changes never race.

use crate::catalog::bluetooth::{self, BluetoothDevice};
use crate::catalog::{Catalog, StreamingAnnouncement, StreamingEvent, GROUP_TXT_KEY};
use crate::config::{Config, ReceiverConfig};
use crate::control::{self, Notifier};
use crate::error::{PcmcastError, Result};
use crate::gate::OwnerGate;
use crate::input::{ChannelScheduler, InputManager};
use crate::output::duplicator::Duplicator;
use crate::output::streaming::CommandStreamer;
use crate::output::OutputRegistry;
use crate::process::Supervisor;
use crate::switchboard::Switchboard;
use pidlock::Pidlock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

/// Device changes reported by background discovery
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Streaming(StreamingEvent),
    Bluetooth(Vec<BluetoothDevice>),
}

/// Announcement for a receiver declared in the config file
pub fn receiver_announcement(receiver: &ReceiverConfig) -> StreamingAnnouncement {
    let mut txt = HashMap::new();
    if let Some(group) = &receiver.group {
        txt.insert(GROUP_TXT_KEY.to_string(), group.clone());
    }
    StreamingAnnouncement {
        name: receiver.name.clone(),
        addresses: vec![receiver.host.clone()],
        port: receiver.port,
        txt,
    }
}

/// One-shot discovery of everything the daemon would offer
pub async fn discover(config: &Config) -> Catalog {
    let mut catalog = Catalog::from_config(config);
    if let Err(e) = catalog.rescan_local().await {
        tracing::warn!("Cannot read local devices from {:?}: {}", catalog.pcm_list(), e);
    }
    for receiver in &config.streaming.receivers {
        catalog.on_streaming_up(receiver_announcement(receiver));
    }
    if config.bluetooth.enabled {
        match bluetooth::poll_devices().await {
            Ok(devices) => {
                catalog.on_bluetooth_devices_changed(devices);
            }
            Err(e) => tracing::warn!("Cannot list Bluetooth devices: {}", e),
        }
    }
    catalog
}

/// Poll bluetoothctl and report the device list on every tick
fn spawn_bluetooth_poller(
    interval: Duration,
    tx: mpsc::UnboundedSender<DiscoveryEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match bluetooth::poll_devices().await {
                Ok(devices) => {
                    if tx.send(DiscoveryEvent::Bluetooth(devices)).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::debug!("bluetoothctl unavailable: {}", e),
            }
        }
    })
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Take the single-instance lock at `path`
///
/// Orphan cleanup kills capture processes this daemon did not start, so two
/// daemons on one host would kill each other's captures.
pub fn acquire_instance_lock(path: &Path) -> Result<Pidlock> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut lock = Pidlock::new(&path.to_string_lossy());
    lock.acquire()
        .map_err(|_| PcmcastError::AlreadyRunning(path.to_path_buf()))?;
    tracing::debug!("Acquired instance lock {:?}", path);
    Ok(lock)
}

/// Main daemon that owns all components
pub struct Daemon {
    config: Config,
    lock_path: PathBuf,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            lock_path: Config::runtime_dir().join("daemon.lock"),
        }
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("Starting pcmcast daemon");

        let mut lock = acquire_instance_lock(&self.lock_path)?;
        let result = self.serve().await;
        if let Err(e) = lock.release() {
            tracing::warn!("Failed to release instance lock {:?}: {:?}", self.lock_path, e);
        }
        result
    }

    async fn serve(&mut self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| PcmcastError::Config(format!("Failed to set up SIGTERM handler: {}", e)))?;

        let (process_tx, mut process_rx) = mpsc::unbounded_channel();
        let (dup_tx, mut dup_rx) = mpsc::unbounded_channel();
        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
        let (request_tx, mut request_rx) = mpsc::unbounded_channel();
        let (discovery_tx, mut discovery_rx) = mpsc::unbounded_channel();

        let supervisor = Arc::new(Supervisor::new(&self.config, process_tx));
        let duplicator = Duplicator::new(dup_tx);
        let streamer = Arc::new(CommandStreamer::new(
            Arc::clone(&supervisor),
            self.config.streaming.command.clone(),
            self.config.streaming.volume_command.clone(),
        ));

        let input = InputManager::new(
            supervisor.clone(),
            Arc::new(ChannelScheduler::new(timer_tx)),
            duplicator.feeder(),
        );
        let outputs = OutputRegistry::new(
            duplicator.clone(),
            supervisor.clone(),
            streamer,
            self.config.session.default_volume,
        );
        let notifier = Notifier::new();
        let mut board = Switchboard::new(
            OwnerGate::new(self.config.session.takeover),
            Catalog::from_config(&self.config),
            input,
            outputs,
            notifier.clone(),
        );

        board.rescan_local().await;
        for receiver in &self.config.streaming.receivers {
            let _ = discovery_tx.send(DiscoveryEvent::Streaming(StreamingEvent::Up(
                receiver_announcement(receiver),
            )));
        }

        let bluetooth_task = self.config.bluetooth.enabled.then(|| {
            tracing::info!("Polling Bluetooth devices");
            spawn_bluetooth_poller(
                Duration::from_secs(self.config.bluetooth.poll_interval_secs.max(1)),
                discovery_tx.clone(),
            )
        });

        let mut rescan = self.config.devices.local_scan.then(|| {
            let period = Duration::from_secs(self.config.devices.scan_interval_secs.max(1));
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        if rescan.is_none() {
            tracing::info!("Periodic local device scan disabled");
        }

        let mut server = control::server::start(&self.config.bind_addr(), request_tx, notifier).await?;
        let mut failure = None;

        loop {
            tokio::select! {
                Some(request) = request_rx.recv() => {
                    board.guarded("control request", |b| b.handle_request(request));
                }
                Some(event) = process_rx.recv() => {
                    board.guarded("process event", |b| b.on_process_event(event));
                }
                Some(event) = dup_rx.recv() => {
                    board.guarded("duplicator event", |b| b.on_duplicator_event(event));
                }
                Some(timer) = timer_rx.recv() => {
                    board.guarded("input timer", |b| b.on_timer(timer));
                }
                Some(event) = discovery_rx.recv() => {
                    board.guarded("discovery event", |b| match event {
                        DiscoveryEvent::Streaming(event) => b.on_streaming_event(event),
                        DiscoveryEvent::Bluetooth(devices) => b.on_bluetooth_devices(devices),
                    });
                }
                _ = next_tick(&mut rescan) => board.rescan_local().await,

                // Without a control surface nobody can steer the daemon
                error = server.stopped() => {
                    tracing::error!("Control server stopped unexpectedly: {}", error);
                    failure = Some(error);
                    break;
                }

                // Handle graceful shutdown (SIGINT from Ctrl+C)
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received SIGINT, shutting down...");
                    break;
                }

                // Handle graceful shutdown (SIGTERM from systemctl stop)
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, shutting down...");
                    break;
                }
            }
        }

        if let Some(task) = bluetooth_task {
            task.abort();
        }
        board.shutdown().await;
        server.shutdown().await;

        tracing::info!("Daemon stopped");
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

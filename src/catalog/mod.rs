//! Device catalog
//!
//! Collects what the daemon knows about devices from three sources:
//!
//! - local ALSA PCMs, rescanned from the kernel's PCM list
//! - streaming receivers, announced by discovery (`up`/`changed`/`down`)
//! - Bluetooth devices, polled from bluetoothctl
//!
//! and turns them into the lists the control surface shows. Streaming
//! receivers advertising the same group key are merged into one stereo output.

pub mod alsa;
pub mod bluetooth;

use crate::config::Config;
use alsa::LocalPcm;
use bluetooth::BluetoothDevice;
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Id of the "no input" entry, always first in the input list
pub const NULL_INPUT_ID: &str = "void";

/// Output id that never resolves to a device
pub const NULL_OUTPUT_ID: &str = "void";

/// TXT record carrying the stereo group key
pub const GROUP_TXT_KEY: &str = "gpn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    None,
    LocalCapture,
    BluetoothCapture,
}

/// Something audio can be captured from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputDescriptor {
    pub id: String,
    pub display_name: String,
    pub kind: InputKind,
}

impl InputDescriptor {
    pub fn null() -> Self {
        Self {
            id: NULL_INPUT_ID.to_string(),
            display_name: "None".to_string(),
            kind: InputKind::None,
        }
    }
}

/// One physically addressable sink
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputMember {
    /// Local playback device, e.g. `plughw:1,0`
    Local { sink_id: String },
    /// Network receiver
    Streaming { host: String, port: u16 },
}

impl OutputMember {
    pub fn streaming(host: impl Into<String>, port: u16) -> Self {
        OutputMember::Streaming {
            host: host.into(),
            port,
        }
    }

    pub fn local(sink_id: impl Into<String>) -> Self {
        OutputMember::Local {
            sink_id: sink_id.into(),
        }
    }
}

impl std::fmt::Display for OutputMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputMember::Local { sink_id } => write!(f, "{}", sink_id),
            OutputMember::Streaming { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// Catalog entry before stereo grouping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDescriptor {
    pub name: String,
    pub member: OutputMember,
    pub stereo_group: Option<String>,
}

/// Output as the control surface sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnifiedOutput {
    pub ui_id: String,
    pub display_name: String,
    pub is_stereo: bool,
    pub members: Vec<OutputMember>,
}

/// A streaming receiver as announced by discovery
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamingAnnouncement {
    pub name: String,
    pub addresses: Vec<String>,
    pub port: u16,
    pub txt: HashMap<String, String>,
}

impl StreamingAnnouncement {
    /// First IPv4 address, else the first address of any kind
    pub fn host(&self) -> Option<&str> {
        self.addresses
            .iter()
            .find(|a| a.parse::<Ipv4Addr>().is_ok())
            .or_else(|| self.addresses.first())
            .map(String::as_str)
    }

    pub fn group(&self) -> Option<&str> {
        self.txt
            .get(GROUP_TXT_KEY)
            .map(String::as_str)
            .filter(|g| !g.is_empty())
    }

    fn key(&self) -> Option<(String, u16)> {
        self.host().map(|h| (h.to_string(), self.port))
    }
}

/// Streaming discovery notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamingEvent {
    Up(StreamingAnnouncement),
    Changed(StreamingAnnouncement),
    Down(StreamingAnnouncement),
}

/// Current view of all devices
#[derive(Debug, Clone)]
pub struct Catalog {
    pcm_list: PathBuf,
    local: Vec<LocalPcm>,
    /// In discovery order
    streaming: Vec<StreamingAnnouncement>,
    bluetooth: Vec<BluetoothDevice>,
}

impl Catalog {
    pub fn new(pcm_list: impl Into<PathBuf>) -> Self {
        Self {
            pcm_list: pcm_list.into(),
            local: Vec::new(),
            streaming: Vec::new(),
            bluetooth: Vec::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.devices.pcm_list)
    }

    pub fn pcm_list(&self) -> &Path {
        &self.pcm_list
    }

    /// Replace the local PCM list, returning whether it changed
    pub fn replace_local(&mut self, devices: Vec<LocalPcm>) -> bool {
        if self.local == devices {
            return false;
        }
        tracing::debug!("Local devices changed: {} entries", devices.len());
        self.local = devices;
        true
    }

    /// Re-read the PCM list from disk
    pub async fn rescan_local(&mut self) -> std::io::Result<bool> {
        let devices = alsa::read_pcm_list(&self.pcm_list).await?;
        Ok(self.replace_local(devices))
    }

    pub fn on_streaming_event(&mut self, event: StreamingEvent) -> bool {
        match event {
            StreamingEvent::Up(a) => self.on_streaming_up(a),
            StreamingEvent::Changed(a) => self.on_streaming_changed(a),
            StreamingEvent::Down(a) => self.on_streaming_down(&a),
        }
    }

    /// A receiver appeared; a known (host, port) is updated in place
    pub fn on_streaming_up(&mut self, announcement: StreamingAnnouncement) -> bool {
        let Some(key) = announcement.key() else {
            tracing::debug!("Ignoring receiver '{}' without address", announcement.name);
            return false;
        };

        match self
            .streaming
            .iter_mut()
            .find(|a| a.key().as_ref() == Some(&key))
        {
            Some(existing) if *existing == announcement => false,
            Some(existing) => {
                *existing = announcement;
                true
            }
            None => {
                tracing::info!(
                    "Receiver up: {} at {}:{}",
                    announcement.name,
                    key.0,
                    key.1
                );
                self.streaming.push(announcement);
                true
            }
        }
    }

    pub fn on_streaming_changed(&mut self, announcement: StreamingAnnouncement) -> bool {
        self.on_streaming_up(announcement)
    }

    pub fn on_streaming_down(&mut self, announcement: &StreamingAnnouncement) -> bool {
        let Some(key) = announcement.key() else {
            return false;
        };
        let before = self.streaming.len();
        self.streaming.retain(|a| a.key().as_ref() != Some(&key));
        let removed = self.streaming.len() != before;
        if removed {
            tracing::info!("Receiver down: {} at {}:{}", announcement.name, key.0, key.1);
        }
        removed
    }

    pub fn on_bluetooth_devices_changed(&mut self, devices: Vec<BluetoothDevice>) -> bool {
        if self.bluetooth == devices {
            return false;
        }
        self.bluetooth = devices;
        true
    }

    /// Null input, local captures, then connected Bluetooth devices
    pub fn inputs(&self) -> Vec<InputDescriptor> {
        let local = self
            .local
            .iter()
            .filter(|pcm| pcm.capture)
            .map(|pcm| InputDescriptor {
                id: pcm.id.clone(),
                display_name: pcm.name.clone(),
                kind: InputKind::LocalCapture,
            });
        let bluetooth = self
            .bluetooth
            .iter()
            .filter(|d| d.connected)
            .map(|d| InputDescriptor {
                id: d.input_id(),
                display_name: d.name.clone(),
                kind: InputKind::BluetoothCapture,
            });

        std::iter::once(InputDescriptor::null())
            .chain(local)
            .chain(bluetooth)
            .collect()
    }

    /// Local playback devices followed by streaming receivers
    pub fn output_descriptors(&self) -> Vec<OutputDescriptor> {
        let local = self
            .local
            .iter()
            .filter(|pcm| pcm.playback)
            .map(|pcm| OutputDescriptor {
                name: pcm.name.clone(),
                member: OutputMember::local(&pcm.id),
                stereo_group: None,
            });
        let streaming = self.streaming.iter().filter_map(|a| {
            Some(OutputDescriptor {
                name: a.name.clone(),
                member: OutputMember::streaming(a.host()?, a.port),
                stereo_group: a.group().map(str::to_string),
            })
        });
        local.chain(streaming).collect()
    }

    pub fn unified_outputs(&self) -> Vec<UnifiedOutput> {
        build_unified_outputs(&self.output_descriptors())
    }

    /// Resolve a control-surface id against the current devices
    pub fn find_output(&self, ui_id: &str) -> Option<UnifiedOutput> {
        if ui_id == NULL_OUTPUT_ID {
            return None;
        }
        self.unified_outputs()
            .into_iter()
            .find(|o| o.ui_id == ui_id)
    }
}

/// Group output descriptors into control-surface outputs
///
/// Local outputs stay singletons. Streaming descriptors are de-duplicated on
/// (name, host, port), then grouped by stereo key; a receiver without a key
/// groups by its own `host:port`. Groups keep first-seen order and members
/// keep discovery order.
pub fn build_unified_outputs(descriptors: &[OutputDescriptor]) -> Vec<UnifiedOutput> {
    let mut outputs = Vec::new();
    let mut seen: Vec<(&str, &OutputMember)> = Vec::new();
    let mut groups: Vec<(String, Vec<&OutputDescriptor>)> = Vec::new();

    for desc in descriptors {
        match &desc.member {
            OutputMember::Local { sink_id } => outputs.push(UnifiedOutput {
                ui_id: format!("local:{}", sink_id),
                display_name: desc.name.clone(),
                is_stereo: false,
                members: vec![desc.member.clone()],
            }),
            OutputMember::Streaming { host, port } => {
                if seen.contains(&(desc.name.as_str(), &desc.member)) {
                    continue;
                }
                seen.push((desc.name.as_str(), &desc.member));

                let key = desc
                    .stereo_group
                    .clone()
                    .unwrap_or_else(|| format!("{}:{}", host, port));
                match groups.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, members)) => members.push(desc),
                    None => groups.push((key, vec![desc])),
                }
            }
        }
    }

    for (key, members) in groups {
        let is_stereo = members.len() > 1;
        let display_name = members
            .iter()
            .map(|d| d.name.as_str())
            .collect::<Vec<_>>()
            .join(" + ");
        outputs.push(UnifiedOutput {
            ui_id: format!("stream:{}", key),
            display_name,
            is_stereo,
            members: members.into_iter().map(|d| d.member.clone()).collect(),
        });
    }

    outputs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming(name: &str, host: &str, port: u16, group: Option<&str>) -> OutputDescriptor {
        OutputDescriptor {
            name: name.to_string(),
            member: OutputMember::streaming(host, port),
            stereo_group: group.map(str::to_string),
        }
    }

    fn announcement(name: &str, addresses: &[&str], port: u16, group: Option<&str>) -> StreamingAnnouncement {
        let mut txt = HashMap::new();
        if let Some(group) = group {
            txt.insert(GROUP_TXT_KEY.to_string(), group.to_string());
        }
        StreamingAnnouncement {
            name: name.to_string(),
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            port,
            txt,
        }
    }

    fn pcm(id: &str, playback: bool, capture: bool) -> LocalPcm {
        LocalPcm {
            id: id.to_string(),
            name: format!("Card {}", id),
            playback,
            capture,
        }
    }

    #[test]
    fn test_stereo_pair_grouping() {
        let outputs = build_unified_outputs(&[
            streaming("A", "h1", 1, Some("Pair")),
            streaming("B", "h2", 2, Some("Pair")),
            streaming("C", "h3", 3, None),
        ]);

        assert_eq!(outputs.len(), 2);
        assert!(outputs[0].is_stereo);
        assert_eq!(outputs[0].ui_id, "stream:Pair");
        assert_eq!(
            outputs[0].members,
            vec![OutputMember::streaming("h1", 1), OutputMember::streaming("h2", 2)]
        );
        assert!(!outputs[1].is_stereo);
        assert_eq!(outputs[1].ui_id, "stream:h3:3");
        assert_eq!(outputs[1].display_name, "C");
    }

    #[test]
    fn test_duplicate_announcements_collapse() {
        let outputs = build_unified_outputs(&[
            streaming("A", "h1", 1, None),
            streaming("A", "h1", 1, None),
        ]);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].members.len(), 1);
        assert!(!outputs[0].is_stereo);
    }

    #[test]
    fn test_single_member_group_is_not_stereo() {
        let outputs = build_unified_outputs(&[streaming("Left", "h1", 1, Some("Lonely"))]);
        assert_eq!(outputs.len(), 1);
        assert!(!outputs[0].is_stereo);
        assert_eq!(outputs[0].ui_id, "stream:Lonely");
    }

    #[test]
    fn test_ungrouped_receivers_never_merge() {
        let outputs = build_unified_outputs(&[
            streaming("Kitchen", "h1", 1, None),
            streaming("Office", "h2", 1, None),
        ]);
        assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().all(|o| !o.is_stereo));
    }

    #[test]
    fn test_local_outputs_are_singletons() {
        let outputs = build_unified_outputs(&[
            OutputDescriptor {
                name: "USB".to_string(),
                member: OutputMember::local("plughw:1,0"),
                stereo_group: None,
            },
            streaming("A", "h1", 1, None),
        ]);
        assert_eq!(outputs[0].ui_id, "local:plughw:1,0");
        assert_eq!(outputs[1].ui_id, "stream:h1:1");
    }

    #[test]
    fn test_ids_are_stable_across_rebuilds() {
        let descriptors = vec![
            streaming("A", "h1", 1, Some("Pair")),
            streaming("B", "h2", 2, Some("Pair")),
        ];
        assert_eq!(
            build_unified_outputs(&descriptors),
            build_unified_outputs(&descriptors)
        );
    }

    #[test]
    fn test_inputs_start_with_null_input() {
        let mut catalog = Catalog::new("/nonexistent");
        assert_eq!(catalog.inputs(), vec![InputDescriptor::null()]);

        catalog.replace_local(vec![pcm("plughw:0,0", true, true), pcm("plughw:1,0", true, false)]);
        catalog.on_bluetooth_devices_changed(vec![
            BluetoothDevice {
                mac: "00:11:22:33:44:55".to_string(),
                name: "Phone".to_string(),
                connected: true,
            },
            BluetoothDevice {
                mac: "66:77:88:99:AA:BB".to_string(),
                name: "Tablet".to_string(),
                connected: false,
            },
        ]);

        let inputs = catalog.inputs();
        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs[0].id, NULL_INPUT_ID);
        assert_eq!(inputs[1].kind, InputKind::LocalCapture);
        assert_eq!(inputs[1].id, "plughw:0,0");
        assert_eq!(inputs[2].kind, InputKind::BluetoothCapture);
        assert_eq!(
            inputs[2].id,
            "bluealsa:SRV=org.bluealsa,DEV=00:11:22:33:44:55,PROFILE=a2dp"
        );
    }

    #[test]
    fn test_replace_local_reports_changes() {
        let mut catalog = Catalog::new("/nonexistent");
        assert!(catalog.replace_local(vec![pcm("plughw:1,0", true, false)]));
        assert!(!catalog.replace_local(vec![pcm("plughw:1,0", true, false)]));
        assert_eq!(catalog.unified_outputs().len(), 1);
        assert!(catalog.inputs().len() == 1);
    }

    #[test]
    fn test_streaming_lifecycle() {
        let mut catalog = Catalog::new("/nonexistent");
        let kitchen = announcement("Kitchen", &["fe80::1", "192.168.1.20"], 7000, None);
        assert_eq!(kitchen.host(), Some("192.168.1.20"));

        assert!(catalog.on_streaming_up(kitchen.clone()));
        assert!(!catalog.on_streaming_up(kitchen.clone()));
        assert!(catalog.find_output("stream:192.168.1.20:7000").is_some());

        // Unknown key on change is an add
        let office = announcement("Office", &["192.168.1.21"], 7000, None);
        assert!(catalog.on_streaming_changed(office));
        assert_eq!(catalog.unified_outputs().len(), 2);

        let renamed = announcement("Kitchen 2", &["192.168.1.20"], 7000, None);
        assert!(catalog.on_streaming_event(StreamingEvent::Changed(renamed)));
        assert_eq!(catalog.unified_outputs()[0].display_name, "Kitchen 2");

        assert!(catalog.on_streaming_down(&kitchen));
        assert!(!catalog.on_streaming_down(&kitchen));
        assert!(catalog.find_output("stream:192.168.1.20:7000").is_none());
    }

    #[test]
    fn test_announced_pair_becomes_stereo_output() {
        let mut catalog = Catalog::new("/nonexistent");
        catalog.on_streaming_up(announcement("Left", &["10.0.0.1"], 7000, Some("Living")));
        catalog.on_streaming_up(announcement("Right", &["10.0.0.2"], 7000, Some("Living")));

        let output = catalog.find_output("stream:Living").unwrap();
        assert!(output.is_stereo);
        assert_eq!(output.display_name, "Left + Right");
        assert_eq!(output.members.len(), 2);
    }

    #[test]
    fn test_null_output_never_resolves() {
        let mut catalog = Catalog::new("/nonexistent");
        catalog.replace_local(vec![pcm("void", true, false)]);
        assert!(catalog.find_output(NULL_OUTPUT_ID).is_none());
    }

    #[test]
    fn test_announcement_without_address_is_ignored() {
        let mut catalog = Catalog::new("/nonexistent");
        assert!(!catalog.on_streaming_up(announcement("Ghost", &[], 7000, None)));
        assert!(catalog.unified_outputs().is_empty());
    }

    #[tokio::test]
    async fn test_rescan_local_reads_pcm_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pcm");
        std::fs::write(&path, "01-00: USB Audio : USB Audio : playback 1\n").unwrap();

        let mut catalog = Catalog::new(&path);
        assert!(catalog.rescan_local().await.unwrap());
        assert!(!catalog.rescan_local().await.unwrap());
        let outputs = catalog.unified_outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].ui_id, "local:plughw:1,0");
        assert_eq!(catalog.inputs().len(), 1);
    }
}

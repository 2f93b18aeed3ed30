//! Local ALSA PCM enumeration
//!
//! The kernel lists PCM devices in `/proc/asound/pcm`, one per line:
//!
//! ```text
//! 00-00: ALC892 Analog : ALC892 Analog : playback 1 : capture 1
//! 01-00: USB Audio : USB Audio : capture 1
//! ```
//!
//! Each line becomes a `plughw:<card>,<device>` id with its capabilities.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// One local PCM device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPcm {
    /// ALSA device string, e.g. `plughw:1,0`
    pub id: String,
    pub name: String,
    /// Can play audio (becomes an output)
    pub playback: bool,
    /// Can record audio (becomes an input)
    pub capture: bool,
}

fn pcm_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d+)-(\d+):(.*)$").expect("static regex"))
}

/// Parse one line of the PCM list
pub fn parse_pcm_line(line: &str) -> Option<LocalPcm> {
    let caps = pcm_line().captures(line)?;
    let card: u32 = caps[1].parse().ok()?;
    let device: u32 = caps[2].parse().ok()?;
    let id = format!("plughw:{},{}", card, device);

    let fields: Vec<&str> = caps[3].split(':').map(str::trim).collect();
    let playback = fields.iter().any(|f| f.starts_with("playback"));
    let capture = fields.iter().any(|f| f.starts_with("capture"));

    // Second field is the device name, first the card's id
    let name = fields
        .get(1)
        .or_else(|| fields.first())
        .filter(|n| !n.is_empty() && !n.starts_with("playback") && !n.starts_with("capture"))
        .map(|n| n.to_string())
        .unwrap_or_else(|| id.clone());

    Some(LocalPcm {
        id,
        name,
        playback,
        capture,
    })
}

/// Parse the whole PCM list, skipping lines that are not device entries
pub fn parse_pcm_list(contents: &str) -> Vec<LocalPcm> {
    contents.lines().filter_map(parse_pcm_line).collect()
}

/// Read and parse the PCM list at `path`
pub async fn read_pcm_list(path: &Path) -> std::io::Result<Vec<LocalPcm>> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(parse_pcm_list(&contents))
}

//! Bluetooth audio sources via bluealsa
//!
//! Pairing and connecting are left to the system (bluetoothctl, desktop
//! applets). This module only lists known devices so connected ones can be
//! offered as capture inputs through bluealsa.

use regex::Regex;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;

/// A paired Bluetooth device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BluetoothDevice {
    /// Upper-case MAC address, e.g. `00:11:22:33:44:55`
    pub mac: String,
    pub name: String,
    pub connected: bool,
}

impl BluetoothDevice {
    /// ALSA device string that captures this device's A2DP stream
    pub fn input_id(&self) -> String {
        input_id(&self.mac)
    }
}

/// bluealsa capture device for `mac`
pub fn input_id(mac: &str) -> String {
    format!("bluealsa:SRV=org.bluealsa,DEV={},PROFILE=a2dp", mac)
}

fn device_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*Device\s+([0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5})\s*(.*)$")
            .expect("static regex")
    })
}

/// Parse `bluetoothctl devices` output into `(mac, name)` pairs
pub fn parse_device_list(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let caps = device_line().captures(line)?;
            let mac = caps[1].to_uppercase();
            let name = match caps[2].trim() {
                "" => mac.clone(),
                name => name.to_string(),
            };
            Some((mac, name))
        })
        .collect()
}

/// Combine the paired and connected listings
pub fn merge_device_lists(paired: &str, connected: &str) -> Vec<BluetoothDevice> {
    let connected = parse_device_list(connected);
    let is_connected = |mac: &str| connected.iter().any(|(m, _)| m == mac);

    let mut devices: Vec<BluetoothDevice> = parse_device_list(paired)
        .into_iter()
        .map(|(mac, name)| BluetoothDevice {
            connected: is_connected(&mac),
            mac,
            name,
        })
        .collect();

    // Older bluetoothctl versions may report a connection before the pairing
    for (mac, name) in &connected {
        if !devices.iter().any(|d| &d.mac == mac) {
            devices.push(BluetoothDevice {
                mac: mac.clone(),
                name: name.clone(),
                connected: true,
            });
        }
    }
    devices
}

async fn bluetoothctl(filter: &str) -> std::io::Result<String> {
    let output = Command::new("bluetoothctl")
        .args(["devices", filter])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Ask bluetoothctl for paired and connected devices
pub async fn poll_devices() -> std::io::Result<Vec<BluetoothDevice>> {
    let paired = bluetoothctl("Paired").await?;
    let connected = bluetoothctl("Connected").await?;
    Ok(merge_device_lists(&paired, &connected))
}

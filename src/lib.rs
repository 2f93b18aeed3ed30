//! pcmcast: capture one audio input and fan it out, live
//!
//! This library provides the core functionality for:
//! - Supervising external capture/playback programs (arecord/aplay by default)
//! - Keeping one input session alive across busy devices and crashes
//! - Duplicating the input stream to local sound cards and network receivers
//! - Listing devices, including stereo pairs of network receivers
//! - A single-owner WebSocket control surface
//!
//! # Architecture
//!
//! ```text
//!          ┌──────────────┐                           ┌──────────────┐
//!          │   Browser    │ ◀──── JSON events ─────── │   Control    │
//!          │  (control)   │ ───── JSON commands ────▶ │ server (/ws) │
//!          └──────────────┘                           └──────────────┘
//!                                                            │
//!                                                            ▼
//!          ┌──────────────┐   discovery    ┌─────────────────────────────────┐
//!          │   Catalog    │ ◀───────────── │          Daemon loop            │
//!          │ alsa/bt/net  │                │  Switchboard + owner gate       │
//!          └──────────────┘                └─────────────────────────────────┘
//!                                             │                     │
//!                                switch_input │                     │ sync_outputs
//!                                             ▼                     ▼
//!                                   ┌──────────────┐       ┌──────────────┐
//!                                   │    Input     │       │    Output    │
//!                                   │   session    │       │   registry   │
//!                                   └──────────────┘       └──────────────┘
//!                                             │                     │
//!                                             ▼                     ▼
//!          ┌──────────────┐  PCM   ┌─────────────────┐  PCM  ┌────────────────┐
//!          │   arecord    │ ─────▶ │   Duplicator    │ ────▶ │ aplay / stream │
//!          │  (capture)   │        │ (+ discard sink)│       │   (N sinks)    │
//!          └──────────────┘        └─────────────────┘       └────────────────┘
//! ```

pub mod catalog;
pub mod cli;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod gate;
pub mod input;
pub mod output;
pub mod process;
pub mod switchboard;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use daemon::Daemon;
pub use error::{PcmcastError, Result};

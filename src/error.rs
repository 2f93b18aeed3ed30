//! Error types for pcmcast
//!
//! Uses thiserror for ergonomic error definitions with clear messages
//! that guide users toward fixing common issues.

use thiserror::Error;

/// Top-level error type for the pcmcast application
#[derive(Error, Debug)]
pub enum PcmcastError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Another pcmcast daemon is already running (lock: {0:?})\n  Stop it first, or remove the lock file if no daemon is running.")]
    AlreadyRunning(std::path::PathBuf),

    #[error("Control server error: {0}")]
    Control(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while supervising external capture/playback programs
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Cannot start '{program}' for device '{device}': {reason}\n  Is alsa-utils installed? Check with: which {program}")]
    Spawn {
        program: String,
        device: String,
        reason: String,
    },

    #[error("Process {0} has no {1} pipe")]
    MissingPipe(u32, &'static str),
}

/// Terminal conditions of the input session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("Input '{device}' is busy after {attempts} attempts. Close other programs using it and reselect the input.")]
    DeviceBusy { device: String, attempts: u32 },

    #[error("Input '{device}' stopped {restarts} times. Please reselect the input.")]
    UnexpectedExit { device: String, restarts: u32 },

    #[error("Input '{device}' failed to start: {reason}")]
    StartFailed { device: String, reason: String },
}

/// Errors related to output sinks (local playback or streaming receivers)
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Cannot attach output '{target}': {reason}")]
    Attach { target: String, reason: String },

    #[error("Cannot stop output '{target}': {reason}")]
    Stop { target: String, reason: String },

    #[error("Cannot set volume on '{target}': {reason}")]
    Volume { target: String, reason: String },
}

/// Result type alias using PcmcastError
pub type Result<T> = std::result::Result<T, PcmcastError>;


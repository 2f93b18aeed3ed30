//! Network streaming receivers
//!
//! The streaming protocol itself lives outside pcmcast. A
//! [`StreamingProvider`] opens one [`StreamingSession`] per receiver; the
//! registry only writes PCM into the session and adjusts its volume.
//!
//! [`CommandStreamer`] is the provider used by the daemon: it runs a
//! configured program per receiver and pipes PCM into its stdin.

use crate::error::SinkError;
use crate::process::{PcmWriter, ProcessHandle, ProcessId, ProcessKind, Supervisor};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

/// Options a session is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    pub volume: u8,
    pub stereo: bool,
}

/// Opens sessions to network receivers
pub trait StreamingProvider: Send + Sync {
    fn add(
        &self,
        host: &str,
        port: u16,
        opts: StreamOptions,
    ) -> Result<Box<dyn StreamingSession>, SinkError>;
}

/// One open connection to a receiver
pub trait StreamingSession: Send {
    /// The PCM writer; can be taken once
    fn take_input(&mut self) -> Option<PcmWriter>;

    fn set_volume(&mut self, volume: u8) -> Result<(), SinkError>;

    fn stop(&mut self) -> Result<(), SinkError>;

    /// Supervised process behind the session, if there is one
    fn process(&self) -> Option<ProcessId> {
        None
    }
}

/// Fill `{host}`, `{port}`, `{volume}` and `{stereo}` into a command template
pub fn expand_template(template: &[String], host: &str, port: u16, opts: StreamOptions) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{host}", host)
                .replace("{port}", &port.to_string())
                .replace("{volume}", &opts.volume.to_string())
                .replace("{stereo}", if opts.stereo { "true" } else { "false" })
        })
        .collect()
}

/// Runs one external streaming program per receiver
pub struct CommandStreamer {
    supervisor: Arc<Supervisor>,
    command: Vec<String>,
    volume_command: Vec<String>,
}

impl CommandStreamer {
    pub fn new(supervisor: Arc<Supervisor>, command: Vec<String>, volume_command: Vec<String>) -> Self {
        Self {
            supervisor,
            command,
            volume_command,
        }
    }
}

impl StreamingProvider for CommandStreamer {
    fn add(
        &self,
        host: &str,
        port: u16,
        opts: StreamOptions,
    ) -> Result<Box<dyn StreamingSession>, SinkError> {
        let target = format!("{}:{}", host, port);
        let args = expand_template(&self.command, host, port, opts);
        let (program, rest) = args.split_first().ok_or_else(|| SinkError::Attach {
            target: target.clone(),
            reason: "no streaming command configured".to_string(),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(rest);
        let mut handle = self
            .supervisor
            .spawn(ProcessKind::Streamer, &target, cmd)
            .map_err(|e| SinkError::Attach {
                target: target.clone(),
                reason: e.to_string(),
            })?;

        let input = handle.take_stdin().ok_or_else(|| SinkError::Attach {
            target: target.clone(),
            reason: "streaming program has no stdin".to_string(),
        })?;

        tracing::info!("Streaming to {} (volume {}, stereo {})", target, opts.volume, opts.stereo);
        Ok(Box::new(CommandSession {
            host: host.to_string(),
            port,
            opts,
            handle: Some(handle),
            input: Some(input),
            volume_command: self.volume_command.clone(),
        }))
    }
}

struct CommandSession {
    host: String,
    port: u16,
    opts: StreamOptions,
    handle: Option<ProcessHandle>,
    input: Option<PcmWriter>,
    volume_command: Vec<String>,
}

impl CommandSession {
    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl StreamingSession for CommandSession {
    fn take_input(&mut self) -> Option<PcmWriter> {
        self.input.take()
    }

    fn set_volume(&mut self, volume: u8) -> Result<(), SinkError> {
        if self.opts.volume == volume && self.handle.is_some() {
            return Ok(());
        }
        self.opts.volume = volume;

        if self.volume_command.is_empty() {
            tracing::debug!(
                "No volume command, {} keeps its start volume",
                self.target()
            );
            return Ok(());
        }

        let args = expand_template(&self.volume_command, &self.host, self.port, self.opts);
        let Some((program, rest)) = args.split_first() else {
            return Ok(());
        };
        let mut child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SinkError::Volume {
                target: self.target(),
                reason: e.to_string(),
            })?;

        let target = self.target();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    tracing::debug!("Volume of {} set to {}", target, volume);
                }
                Ok(status) => tracing::warn!("Volume command for {} failed: {}", target, status),
                Err(e) => tracing::warn!("Volume command for {} failed: {}", target, e),
            }
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), SinkError> {
        self.input = None;
        match self.handle.take() {
            Some(handle) => {
                handle.terminate(true);
                Ok(())
            }
            None => Err(SinkError::Stop {
                target: self.target(),
                reason: "already stopped".to_string(),
            }),
        }
    }

    fn process(&self) -> Option<ProcessId> {
        self.handle.as_ref().map(ProcessHandle::id)
    }
}

//! Paced, line-oriented command writes.
//!
//! The tracker firmware reads one line at a time and drops input that
//! arrives while it is still handling the previous command. Pacing is
//! deadline based: the next write never starts earlier than `gap` after the
//! previous write finished, however late this task gets scheduled.

use std::fmt;
use std::time::Duration;

use log::debug;
use secrecy::zeroize::Zeroizing;
use secrecy::{ExposeSecret, SecretString};
use tokio::time::{self, Instant};

use crate::error::Result;
use crate::transport::ChannelHandle;

/// Commands understood by the tracker firmware.
#[derive(Clone, Copy)]
pub enum Command<'a> {
    /// `DEVICE_ID=<id>`: assign identity.
    DeviceId(&'a str),
    /// `TOKEN=<token>`: assign credential.
    Token(&'a SecretString),
    /// `PROVISION`: commit the assignment.
    Provision,
    /// `INFO`: query stored state.
    Info,
}

impl Command<'_> {
    /// The line sent to the device, without terminator.
    fn line(&self) -> Zeroizing<String> {
        Zeroizing::new(match self {
            Command::DeviceId(id) => format!("DEVICE_ID={id}"),
            Command::Token(token) => format!("TOKEN={}", token.expose_secret()),
            Command::Provision => "PROVISION".to_string(),
            Command::Info => "INFO".to_string(),
        })
    }
}

/// Prints the command with secrets masked.
impl fmt::Display for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::DeviceId(id) => write!(f, "DEVICE_ID={id}"),
            Command::Token(_) => f.write_str("TOKEN=***"),
            Command::Provision => f.write_str("PROVISION"),
            Command::Info => f.write_str("INFO"),
        }
    }
}

impl fmt::Debug for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Writes newline-terminated commands to a channel handle.
#[derive(Debug)]
pub struct CommandWriter {
    handle: ChannelHandle,
    last_write: Option<Instant>,
}

impl CommandWriter {
    pub fn new(handle: ChannelHandle) -> Self {
        Self {
            handle,
            last_write: None,
        }
    }

    /// Send one command right away.
    pub async fn send(&mut self, command: Command<'_>) -> Result<()> {
        let mut line = command.line();
        line.push('\n');
        debug!("-> {}", command);
        self.handle.write(line.as_bytes()).await?;
        self.last_write = Some(Instant::now());
        Ok(())
    }

    /// Send a command no earlier than `gap` after the previous write.
    pub async fn send_after(&mut self, command: Command<'_>, gap: Duration) -> Result<()> {
        self.pace(gap).await;
        self.send(command).await
    }

    /// Send commands in order, spaced at least `gap` apart.
    pub async fn send_sequence(&mut self, commands: &[Command<'_>], gap: Duration) -> Result<()> {
        for command in commands {
            self.send_after(*command, gap).await?;
        }
        Ok(())
    }

    /// Sleep until `gap` has passed since the previous write.
    ///
    /// Returns immediately if nothing has been written yet.
    pub async fn pace(&self, gap: Duration) {
        if let Some(last) = self.last_write {
            time::sleep_until(last + gap).await;
        }
    }

    /// When the last write completed.
    pub fn last_write(&self) -> Option<Instant> {
        self.last_write
    }
}

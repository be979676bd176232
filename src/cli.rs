//! CLI utilities for pubsock.
//!
//! The utilities present in this module can be used to build an interactive subscriber: each
//! prompt reads one line and turns it into a [`Command`] for a
//! [`ClientSubscriber`](crate::pubsub::ClientSubscriber).
//!
//! # Commands
//!
//! - `.subscribe NAME...`: Start receiving the named topics.
//! - `.unsubscribe NAME...`: Stop receiving the named topics.
//! - `.pause` / `.unpause`: Suspend or resume delivery.
//! - `.exit`: Close the connection.
use std::io::{BufRead, Write};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("no command provided")]
    Empty,

    #[error("failed to read command: {0}")]
    Io(String),
}

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Pause,
    Unpause,
    Exit,
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut parts = value.split_whitespace();
        let Some(command) = parts.next() else {
            return Err(CommandError::Empty);
        };
        let names: Vec<String> = parts.map(str::to_string).collect();

        match command {
            ".exit" => Ok(Command::Exit),
            ".pause" => Ok(Command::Pause),
            ".unpause" => Ok(Command::Unpause),
            ".subscribe" | ".unsubscribe" if names.is_empty() => {
                Err(CommandError::InvalidCommandArguments {
                    command: command.to_string(),
                    reason: format!("requires at least one topic. Example: {command} AAPL GOOG"),
                })
            }
            ".subscribe" => Ok(Command::Subscribe(names)),
            ".unsubscribe" => Ok(Command::Unsubscribe(names)),
            s => Err(CommandError::UnrecognizedCommand(s.to_string())),
        }
    }
}

/// Prompt user for a valid command.
///
/// End of input is treated as [`Command::Exit`].
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, CommandError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")
        .and_then(|_| writer.flush())
        .map_err(|e| CommandError::Io(e.to_string()))?;

    let read = reader
        .read_line(&mut s)
        .map_err(|e| CommandError::Io(e.to_string()))?;
    if read == 0 {
        return Ok(Command::Exit);
    }

    s.trim_end().try_into()
}

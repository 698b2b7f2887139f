pub mod del;
pub mod executable;
pub mod exists;
pub mod get;
pub mod set;

use bytes::Bytes;
use std::{str, vec};
use thiserror::Error as ThisError;
use tracing::{debug, error};

use crate::commands::executable::Executable;
use crate::frame::{CommandFrame, Frame};
use crate::store::Store;
use crate::Error;

use del::Del;
use exists::Exists;
use get::Get;
use set::Set;

/// Reply for unknown commands, wrong arities and malformed frames.
pub const UNKNOWN_COMMAND: &str = "Unknown command or invalid arguments";
pub const EMPTY_KEY: &str = "Key cannot be empty";
pub const INTERNAL_ERROR: &str = "Internal server error";

#[derive(Debug, PartialEq)]
pub enum Command {
    Del(Del),
    Exists(Exists),
    Get(Get),
    Set(Set),
}

impl Executable for Command {
    fn exec(self, store: Store) -> Result<Frame, Error> {
        match self {
            Command::Del(cmd) => cmd.exec(store),
            Command::Exists(cmd) => cmd.exec(store),
            Command::Get(cmd) => cmd.exec(store),
            Command::Set(cmd) => cmd.exec(store),
        }
    }
}

/// Number of arguments a command takes, not counting its name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => count == n,
            Arity::AtLeast(n) => count >= n,
        }
    }
}

struct CommandEntry {
    name: &'static str,
    arity: Arity,
    parse: fn(&mut CommandParser) -> Result<Command, CommandParserError>,
}

static COMMANDS: &[CommandEntry] = &[
    CommandEntry {
        name: "del",
        arity: Arity::AtLeast(1),
        parse: |parser| Del::try_from(parser).map(Command::Del),
    },
    CommandEntry {
        name: "exists",
        arity: Arity::Exact(1),
        parse: |parser| Exists::try_from(parser).map(Command::Exists),
    },
    CommandEntry {
        name: "get",
        arity: Arity::Exact(1),
        parse: |parser| Get::try_from(parser).map(Command::Get),
    },
    CommandEntry {
        name: "set",
        arity: Arity::Exact(2),
        parse: |parser| Set::try_from(parser).map(Command::Set),
    },
];

fn lookup(name: &[u8]) -> Option<&'static CommandEntry> {
    COMMANDS
        .iter()
        .find(|entry| entry.name.as_bytes().eq_ignore_ascii_case(name))
}

impl TryFrom<CommandFrame> for Command {
    type Error = CommandParserError;

    fn try_from(frame: CommandFrame) -> Result<Self, Self::Error> {
        let mut parts = frame.into_args().into_iter();

        let name = parts.next().ok_or(CommandParserError::EndOfStream)?;
        let entry = lookup(&name).ok_or_else(|| CommandParserError::UnknownCommand {
            command: String::from_utf8_lossy(&name).into_owned(),
        })?;

        if !entry.arity.accepts(parts.len()) {
            return Err(CommandParserError::WrongArity {
                command: entry.name.to_string(),
                arity: entry.arity,
                actual: parts.len(),
            });
        }

        let parser = &mut CommandParser { parts };
        (entry.parse)(parser)
    }
}

/// Runs one decoded command against the store and returns the reply. Command errors become
/// error replies; they never end the connection.
pub fn dispatch(frame: CommandFrame, store: &Store) -> Frame {
    let cmd = match Command::try_from(frame) {
        Ok(cmd) => cmd,
        Err(e) => {
            debug!("Rejected command: {}", e);
            return e.reply();
        }
    };

    debug!("Executing command: {:?}", cmd);
    cmd.exec(store.clone()).unwrap_or_else(|e| {
        error!("Failed to execute command: {}", e);
        Frame::Error(INTERNAL_ERROR.to_string())
    })
}

pub struct CommandParser {
    parts: vec::IntoIter<Bytes>,
}

impl CommandParser {
    fn next_string(&mut self) -> Result<String, CommandParserError> {
        let bytes = self.next_bytes()?;

        str::from_utf8(&bytes[..])
            .map(|s| s.to_string())
            .map_err(CommandParserError::InvalidUTF8String)
    }

    fn next_bytes(&mut self) -> Result<Bytes, CommandParserError> {
        self.parts.next().ok_or(CommandParserError::EndOfStream)
    }
}

#[derive(Debug, ThisError, PartialEq)]
pub enum CommandParserError {
    #[error("protocol error; unknown command {command}")]
    UnknownCommand { command: String },
    #[error("protocol error; {command} expects {arity:?} arguments, got {actual}")]
    WrongArity {
        command: String,
        arity: Arity,
        actual: usize,
    },
    #[error("protocol error; empty key")]
    EmptyKey,
    #[error("protocol error; invalid UTF-8 string")]
    InvalidUTF8String(#[from] str::Utf8Error),
    #[error("protocol error; attempting to extract a value failed due to the frame being fully consumed")]
    EndOfStream,
}

impl CommandParserError {
    /// The error reply sent to the client.
    pub fn reply(&self) -> Frame {
        match self {
            CommandParserError::EmptyKey => Frame::Error(EMPTY_KEY.to_string()),
            _ => Frame::Error(UNKNOWN_COMMAND.to_string()),
        }
    }
}

pub mod executable;
pub mod get;
pub mod info;
pub mod ping;
pub mod set;

use bytes::Bytes;
use std::vec;
use strum_macros::IntoStaticStr;
use thiserror::Error as ThisError;

use crate::commands::executable::Executable;
use crate::frame::Frame;
use crate::store::{self, Storage};

use get::Get;
use info::Info;
use ping::Ping;
use set::Set;

#[derive(Debug, PartialEq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Command {
    Get(Get),
    Set(Set),

    Info(Info),
    Ping(Ping),
}

impl Command {
    /// Lowercase command name, as used in metric names.
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

impl Executable for Command {
    fn exec(self, store: &dyn Storage) -> Result<Frame, store::Error> {
        match self {
            Command::Get(cmd) => cmd.exec(store),
            Command::Info(cmd) => cmd.exec(store),
            Command::Ping(cmd) => cmd.exec(store),
            Command::Set(cmd) => cmd.exec(store),
        }
    }
}

impl TryFrom<Vec<Bytes>> for Command {
    type Error = CommandParserError;

    /// Interprets a decoded request. The first element names the command, case insensitively;
    /// the rest are its arguments.
    fn try_from(parts: Vec<Bytes>) -> Result<Self, Self::Error> {
        let parser = &mut CommandParser {
            parts: parts.into_iter(),
        };

        let command_name = parser.parse_command_name()?;

        match &command_name[..] {
            "get" => Get::try_from(parser).map(Command::Get),
            "info" => Info::try_from(parser).map(Command::Info),
            "ping" => Ping::try_from(parser).map(Command::Ping),
            "set" => Set::try_from(parser).map(Command::Set),
            _ => Err(CommandParserError::UnrecognizedCommand {
                command: command_name,
            }),
        }
    }
}

pub(crate) struct CommandParser {
    parts: vec::IntoIter<Bytes>,
}

impl CommandParser {
    fn parse_command_name(&mut self) -> Result<String, CommandParserError> {
        let command_name = self
            .parts
            .next()
            .ok_or(CommandParserError::MalformedRequest)?;

        Ok(String::from_utf8_lossy(&command_name).to_lowercase())
    }

    /// Next mandatory argument.
    fn next_bytes(&mut self) -> Result<Bytes, CommandParserError> {
        self.parts
            .next()
            .ok_or(CommandParserError::WrongNumberOfArguments)
    }

    /// Next optional argument, uppercased so it can be matched against option names.
    fn next_option(&mut self) -> Option<String> {
        self.parts
            .next()
            .map(|bytes| String::from_utf8_lossy(&bytes).to_uppercase())
    }

    fn skip(&mut self) -> bool {
        self.parts.next().is_some()
    }

    /// Fails if there are arguments left.
    fn finish(&mut self) -> Result<(), CommandParserError> {
        match self.parts.next() {
            Some(_) => Err(CommandParserError::WrongNumberOfArguments),
            None => Ok(()),
        }
    }
}

#[derive(Debug, ThisError, PartialEq)]
pub enum CommandParserError {
    #[error("malformed request")]
    MalformedRequest,
    #[error("unrecognized command")]
    UnrecognizedCommand { command: String },
    #[error("wrong number of arguments for command")]
    WrongNumberOfArguments,
    #[error("the XX option to SET is not supported")]
    SetXXUnsupported,
    #[error("the NX option to SET is required")]
    SetNXRequired,
    #[error("expiry parameter {option} provided without a value")]
    MissingExpiryValue { option: String },
}

use std::{fmt, str::FromStr};

use crate::error::Error;

/// Verbs understood by the line protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Push,
    Pull,
    Get,
    Status,
    Prepare,
    Accept,
    Set,
}

impl Command {
    /// The complete command set, fixed at compile time.
    pub const ALL: [Command; 7] = [
        Command::Push,
        Command::Pull,
        Command::Get,
        Command::Status,
        Command::Prepare,
        Command::Accept,
        Command::Set,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Command::Push => "push",
            Command::Pull => "pull",
            Command::Get => "get",
            Command::Status => "status",
            Command::Prepare => "prepare",
            Command::Accept => "accept",
            Command::Set => "set",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|cmd| cmd.as_str() == token)
            .ok_or_else(|| Error::UnknownCommand(token.to_string()))
    }
}

//! Player actions carried through the replicated log.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// A single user-originated command to be globally ordered.
///
/// Actions have no intrinsic id; they are identified by their position in
/// the log once the leader has appended them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub username: String,
    pub command: String,
}

impl Action {
    pub fn new(username: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            command: command.into(),
        }
    }

    /// Wraps an administrative command issued by `leader`.
    pub fn admin(leader: impl Into<String>, command: &AdminCommand) -> Self {
        Self::new(leader, command.to_string())
    }

    /// Parses the command as an administrative command, if it is one.
    pub fn as_admin(&self) -> Option<AdminCommand> {
        AdminCommand::parse(&self.command)
    }
}

/// An action paired with its log position and the term of the leader that
/// appended it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub action: Action,
}

const ADD_MEMBER: &str = "ADD_MEMBER";

/// Membership changes recorded in the log alongside player actions.
///
/// Encoded as a plain command string so the log stays a sequence of
/// `Action`s: `ADD_MEMBER <username> <unix-millis> <address>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    AddMember {
        username: String,
        joined_at_ms: u128,
        address: SocketAddr,
    },
}

impl AdminCommand {
    pub fn parse(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace();
        match parts.next()? {
            ADD_MEMBER => {
                let username = parts.next()?.to_string();
                let joined_at_ms = parts.next()?.parse().ok()?;
                let address = parts.next()?.parse().ok()?;
                if parts.next().is_some() {
                    return None;
                }
                Some(AdminCommand::AddMember {
                    username,
                    joined_at_ms,
                    address,
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for AdminCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminCommand::AddMember {
                username,
                joined_at_ms,
                address,
            } => write!(f, "{ADD_MEMBER} {username} {joined_at_ms} {address}"),
        }
    }
}

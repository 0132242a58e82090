//! Console command parsing for the interactive shell.
//!
//! Separate from [`crate::action::Action`]: a `ConsoleCommand` is what the
//! player typed, including local meta-commands like STATUS and EXIT. Only
//! `ACT` turns into an action submitted to the group.

use anyhow::{Result, anyhow};

/// Commands that can be entered at the console prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Act { command: String },
    Log,
    Status,
    Exit,
    Help,
}

impl ConsoleCommand {
    /// Parses a line of user input into a command.
    ///
    /// # Syntax
    /// Keywords are case-insensitive and support aliases:
    /// - `ACT <command...>` (alias: `a`) - Submit a game action; the rest of the
    ///   line is the action text, kept verbatim
    /// - `LOG` (alias: `l`) - Print the applied action history
    /// - `STATUS` (alias: `s`) - Show role, leader, term, log and sessions
    /// - `HELP` (alias: `h`) - Print command reference
    /// - `EXIT` (alias: `e`) - Leave the group and shut down
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let Some(keyword) = trimmed.split_whitespace().next() else {
            return Err(anyhow!("empty command"));
        };
        let rest = trimmed[keyword.len()..].trim();

        let command = match keyword.to_uppercase().as_str() {
            "A" | "ACT" if rest.is_empty() => {
                return Err(anyhow!("ACT requires an action: ACT <action>"));
            }
            "A" | "ACT" => {
                return Ok(ConsoleCommand::Act {
                    command: rest.to_string(),
                });
            }
            "L" | "LOG" => ConsoleCommand::Log,
            "S" | "STATUS" => ConsoleCommand::Status,
            "H" | "HELP" => ConsoleCommand::Help,
            "E" | "EXIT" => ConsoleCommand::Exit,
            _ => {
                return Err(anyhow!(
                    "invalid command. Try: ACT/a <action>, LOG/l, STATUS/s, HELP/h, EXIT/e"
                ));
            }
        };

        if !rest.is_empty() {
            return Err(anyhow!("{keyword} takes no arguments"));
        }
        Ok(command)
    }
}

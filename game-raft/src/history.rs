//! In-memory record of applied actions.

use parking_lot::Mutex;

use crate::action::LogEntry;
use crate::applier::StateMachine;

/// A [`StateMachine`] that keeps every applied entry.
///
/// Used by the console to print the agreed game history and by tests to
/// compare what each node applied.
#[derive(Debug, Default)]
pub struct ActionHistory {
    entries: Mutex<Vec<LogEntry>>,
}

impl ActionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Clones the applied entries so callers never hold the lock.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Applied game actions, skipping membership entries.
    pub fn commands(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.action.as_admin().is_none())
            .map(|e| e.action.command.clone())
            .collect()
    }
}

impl StateMachine for ActionHistory {
    fn apply(&self, entry: &LogEntry) {
        self.entries.lock().push(entry.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, AdminCommand};

    #[test]
    fn commands_skip_membership_entries() {
        let history = ActionHistory::new();
        let join = AdminCommand::AddMember {
            username: "ann".into(),
            joined_at_ms: 1,
            address: "127.0.0.1:7000".parse().unwrap(),
        };
        history.apply(&LogEntry {
            index: 0,
            term: 1,
            action: Action::admin("ann", &join),
        });
        history.apply(&LogEntry {
            index: 1,
            term: 1,
            action: Action::new("ann", "draw card"),
        });

        assert_eq!(history.len(), 2);
        assert_eq!(history.commands(), vec!["draw card".to_string()]);
    }
}

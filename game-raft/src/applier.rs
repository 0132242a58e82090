//! Delivery of committed entries to the application.

use std::sync::Arc;

use tracing::debug;

use crate::action::LogEntry;
use crate::node::RaftNode;

/// The application side of the log: receives every committed entry exactly
/// once, in index order, on every node.
///
/// Membership entries (`ADD_MEMBER ...`) are delivered like any other action;
/// use [`crate::action::Action::as_admin`] to tell them apart.
pub trait StateMachine: Send + Sync {
    fn apply(&self, entry: &LogEntry);
}

pub(crate) fn spawn(node: &Arc<RaftNode>) {
    node.tasks.spawn(run(Arc::clone(node)));
}

async fn run(node: Arc<RaftNode>) {
    let cancel = node.shutdown_token();
    let mut next: u64 = 0;
    debug!("applier started");

    while node.is_active() {
        let committed = node.log.commit_index();
        while (next as i64) <= committed {
            let Some(entry) = node.log.entry(next) else {
                break;
            };
            node.state_machine.apply(&entry);
            next += 1;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = node.log.wait_until(|log| log.commit_index() >= next as i64) => {}
        }
    }
    debug!(applied = next, "applier stopped");
}

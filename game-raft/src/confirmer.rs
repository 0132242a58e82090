//! Leader-side commit advancement.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::node::RaftNode;
use crate::session::MembershipState;

/// Highest index acknowledged by a strict majority of `acks`, if any.
///
/// `acks` holds one greatest-acknowledged index per live member, the leader
/// included. -1 means "nothing acknowledged".
pub fn committable_index(acks: &[i64]) -> Option<i64> {
    if acks.is_empty() {
        return None;
    }
    let mut sorted = acks.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    let index = sorted[acks.len() / 2];
    (index >= 0).then_some(index)
}

pub(crate) fn spawn(node: &Arc<RaftNode>, cancel: CancellationToken) {
    node.tasks.spawn(run(Arc::clone(node), cancel));
}

async fn run(node: Arc<RaftNode>, cancel: CancellationToken) {
    debug!("log confirmer started");
    while node.is_active() && node.state() == MembershipState::Leader {
        if let Some(index) = committable_index(&node.sessions.live_acks()) {
            // Entries of earlier terms commit along with the first entry of
            // this term; a majority holding them alone is not enough.
            let current = node.log.term_at(index as u64) == Some(node.term());
            if current && node.commit_action(index) {
                debug!(index, "commit index advanced");
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = node.confirmer_wake.notified() => {}
        }
    }
    debug!("log confirmer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_a_strict_majority() {
        assert_eq!(committable_index(&[]), None);
        assert_eq!(committable_index(&[3]), Some(3));
        assert_eq!(committable_index(&[5, -1]), None);
        assert_eq!(committable_index(&[5, 2]), Some(2));
        assert_eq!(committable_index(&[5, 2, -1]), Some(2));
        assert_eq!(committable_index(&[0, -1, -1]), None);
        assert_eq!(committable_index(&[9, 7, 7, 1, -1]), Some(7));
        assert_eq!(committable_index(&[9, 7, 1, 1]), Some(1));
    }

    #[test]
    fn timed_out_members_do_not_count() {
        // Leader and one follower acknowledged index 0; a third follower has
        // timed out and is left out of the live set entirely.
        assert_eq!(committable_index(&[0, 0]), Some(0));
        // With it counted as live the same acks would not be enough for index 1.
        assert_eq!(committable_index(&[1, 0, -1]), Some(0));
    }
}

//! Follower-side log maintenance.
//!
//! Leader entries may arrive out of order, so the receiver parks them in an
//! index-keyed buffer. The maintainer moves them into the log strictly in
//! index order and acknowledges progress back to the leader.
//!
//! The log is append-only, so a follower that once led (or followed a leader
//! that was later replaced) may hold entries the current leader never had.
//! [`LeaderAgreement`] tracks how much of the log is known to match the
//! current leader's. Only that prefix is acknowledged and committed.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::action::{Action, LogEntry};
use crate::log::ActionLog;
use crate::node::RaftNode;
use crate::session::MembershipState;

/// A leader entry waiting in the buffer for its predecessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderEntry {
    /// Term of the leader that sent it.
    pub leader_term: u64,
    /// Term the entry was appended in.
    pub term: u64,
    /// Term of the leader's entry just before it.
    pub prev_term: u64,
    pub action: Action,
}

#[derive(Debug)]
struct Agreement {
    leader_term: u64,
    verified: i64,
    conflict: Option<u64>,
}

/// How far this node's log is known to match the current leader's.
///
/// Two logs holding an entry with the same index and term hold the same
/// entries up to it, because every append checks the term of the entry
/// before it. Matching one entry's term therefore verifies the whole prefix.
#[derive(Debug)]
pub struct LeaderAgreement {
    inner: Mutex<Agreement>,
}

impl Default for LeaderAgreement {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderAgreement {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Agreement {
                leader_term: 0,
                verified: -1,
                conflict: None,
            }),
        }
    }

    /// Highest index known to match the current leader's log, or -1.
    pub fn verified(&self) -> i64 {
        self.inner.lock().verified
    }

    /// First index where this log disagrees with the current leader's.
    pub fn conflict(&self) -> Option<u64> {
        self.inner.lock().conflict
    }

    pub fn leader_term(&self) -> u64 {
        self.inner.lock().leader_term
    }

    /// Starts over for the leader of `term`. Committed entries are in every
    /// later leader's log, so `committed` stays verified. Returns whether
    /// the leader changed.
    pub fn follow(&self, term: u64, committed: i64) -> bool {
        let mut inner = self.inner.lock();
        if inner.leader_term == term {
            return false;
        }
        *inner = Agreement {
            leader_term: term,
            verified: committed,
            conflict: None,
        };
        true
    }

    /// Records that the entry at `index` matches the leader of `term`.
    pub fn confirm(&self, term: u64, index: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.leader_term != term || inner.verified >= index as i64 {
            return false;
        }
        inner.verified = index as i64;
        true
    }

    /// Records that the entry at `index` differs from the leader of `term`.
    /// Returns true only for the first conflict found under that leader.
    pub fn disagree(&self, term: u64, index: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.leader_term != term || inner.conflict.is_some_and(|c| c <= index) {
            return false;
        }
        inner.conflict = Some(index);
        true
    }
}

/// Result of one pass over the buffer.
#[derive(Debug, Default)]
pub struct Drained {
    pub appended: Vec<LogEntry>,
    /// Index of our entry that turned out to differ from the leader's.
    pub conflict: Option<u64>,
}

/// Moves every buffered entry that extends the log contiguously into it, then
/// discards buffered entries the log already covers.
///
/// An entry is only appended when the term of our last entry matches the
/// leader's entry before it; otherwise the buffer is dropped and the
/// conflict reported. Entries sent by an earlier leader are discarded.
pub fn drain_contiguous(
    buffer: &DashMap<u64, LeaderEntry>,
    log: &ActionLog,
    agreement: &LeaderAgreement,
) -> Drained {
    let mut drained = Drained::default();
    let leader_term = agreement.leader_term();
    loop {
        let next = log.len();
        let Some((_, entry)) = buffer.remove(&next) else {
            break;
        };
        if entry.leader_term != leader_term {
            continue;
        }
        if log.term_before(next) != Some(entry.prev_term) {
            let index = next.saturating_sub(1);
            if agreement.disagree(leader_term, index) {
                drained.conflict = Some(index);
            }
            buffer.clear();
            break;
        }
        if log.append_at(next, entry.term, entry.action.clone()) {
            agreement.confirm(leader_term, next);
            drained.appended.push(LogEntry {
                index: next,
                term: entry.term,
                action: entry.action,
            });
        }
    }
    let next = log.len();
    buffer.retain(|index, _| *index >= next);
    drained
}

/// Starts a maintainer. Any maintainer spawned earlier exits on its next wake.
pub(crate) fn spawn(node: &Arc<RaftNode>, cancel: CancellationToken) {
    let epoch = node.maintainer_epoch.fetch_add(1, Ordering::AcqRel) + 1;
    node.maintainer_wake.notify_one();
    node.tasks.spawn(run(Arc::clone(node), cancel, epoch));
}

async fn run(node: Arc<RaftNode>, cancel: CancellationToken, epoch: u64) {
    debug!(epoch, "log maintainer started");
    loop {
        if !node.is_active()
            || node.state() != MembershipState::Follower
            || node.maintainer_epoch.load(Ordering::Acquire) != epoch
        {
            break;
        }

        let drained = drain_contiguous(&node.buffer, &node.log, &node.agreement);
        if let Some(index) = drained.conflict {
            error!(
                index,
                commit = node.commit_index(),
                "local log differs from the leader's, no longer committing past it"
            );
        }
        if !drained.appended.is_empty() {
            for entry in &drained.appended {
                node.observe_entry(entry);
            }
            debug!(
                from = drained.appended[0].index,
                count = drained.appended.len(),
                "appended leader entries"
            );
            node.send_ack().await;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = node.maintainer_wake.notified() => {}
        }
    }
    debug!(epoch, "log maintainer stopped");
}

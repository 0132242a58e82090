//! Leader election: terms, votes and role changes.
//!
//! Every leader-originated packet carries the leader's term. A follower that
//! hears nothing from its leader for a randomized timeout becomes a
//! candidate, bumps the term and asks every known member for a vote. A member
//! grants at most one vote per term, and only to a candidate whose last entry
//! is at least as recent as its own: a newer last term, or the same last term
//! and at least as many entries. A strict majority of the known
//! members, the candidate included, makes a new leader. Any packet with a
//! newer term sends leaders and candidates back to FOLLOWER.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::TimerConfig;
use crate::follower;
use crate::node::RaftNode;
use crate::packet::Packet;
use crate::session::{MembershipState, Session};

#[derive(Debug, Default)]
struct VoteRecord {
    term: u64,
    voted_for: Option<String>,
    granted: HashSet<String>,
}

#[derive(Debug)]
pub(crate) struct ElectionState {
    term: AtomicU64,
    vote: Mutex<VoteRecord>,
    last_contact: Mutex<Instant>,
    deadline: Mutex<Duration>,
    timeout: Duration,
    jitter: Duration,
}

impl ElectionState {
    pub(crate) fn new(timers: &TimerConfig) -> Self {
        let state = Self {
            term: AtomicU64::new(0),
            vote: Mutex::new(VoteRecord::default()),
            last_contact: Mutex::new(Instant::now()),
            deadline: Mutex::new(timers.election_timeout),
            timeout: timers.election_timeout,
            jitter: timers.election_jitter,
        };
        state.contact();
        state
    }

    pub(crate) fn term(&self) -> u64 {
        self.term.load(Ordering::Acquire)
    }

    /// Raises the term to `term` if it is newer. Returns whether it moved.
    pub(crate) fn observe_term(&self, term: u64) -> bool {
        let previous = self.term.fetch_max(term, Ordering::AcqRel);
        previous < term
    }

    /// Restarts the silence timer with a freshly randomized deadline.
    pub(crate) fn contact(&self) {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        *self.deadline.lock() = self.timeout + Duration::from_millis(extra);
        *self.last_contact.lock() = Instant::now();
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        let last = *self.last_contact.lock();
        now.saturating_duration_since(last) > *self.deadline.lock()
    }

    /// Silent for half the base timeout; the leader may have stopped
    /// sending to us.
    pub(crate) fn is_quiet(&self, now: Instant) -> bool {
        let last = *self.last_contact.lock();
        now.saturating_duration_since(last) > self.timeout / 2
    }

    /// Starts a new term voting for `me`. Returns the new term.
    fn begin(&self, me: &str) -> u64 {
        let term = self.term.fetch_add(1, Ordering::AcqRel) + 1;
        let mut vote = self.vote.lock();
        vote.term = term;
        vote.voted_for = Some(me.to_string());
        vote.granted.clear();
        vote.granted.insert(me.to_string());
        drop(vote);
        self.contact();
        term
    }

    /// Grants `candidate` this node's vote for `term` unless it already went
    /// to someone else.
    fn grant(&self, candidate: &str, term: u64) -> bool {
        let mut vote = self.vote.lock();
        if vote.term > term {
            return false;
        }
        if vote.term < term {
            *vote = VoteRecord {
                term,
                ..VoteRecord::default()
            };
        }
        match &vote.voted_for {
            Some(existing) => existing == candidate,
            None => {
                vote.voted_for = Some(candidate.to_string());
                true
            }
        }
    }

    /// Counts a granted vote for our own candidacy in `term`.
    fn record_vote(&self, voter: &str, term: u64) -> usize {
        let mut vote = self.vote.lock();
        if vote.term != term {
            return 0;
        }
        vote.granted.insert(voter.to_string());
        vote.granted.len()
    }
}

impl RaftNode {
    pub(crate) async fn election_tick(self: &Arc<Self>) {
        if !self.crypto().has_group_secret() {
            return;
        }
        match self.state() {
            MembershipState::Follower | MembershipState::Candidate => {}
            _ => return,
        }
        let now = Instant::now();
        if self.election.is_due(now) {
            self.start_election().await;
        } else if self.state() == MembershipState::Follower && self.election.is_quiet(now) {
            // A leader that marked us timed out skips us in its broadcast
            // until it hears from us again.
            self.send_ack().await;
        }
    }

    pub(crate) async fn start_election(self: &Arc<Self>) {
        let from_follower = self
            .state
            .transition(MembershipState::Follower, MembershipState::Candidate);
        if !from_follower && self.state() != MembershipState::Candidate {
            return;
        }
        if from_follower {
            // Lets the log maintainer see the role change and exit.
            self.maintainer_wake.notify_one();
        }

        self.set_leader_name(None);
        let term = self.election.begin(self.username());
        let peers = self.sessions.peers_of(self.username());
        info!(term, peers = peers.len(), "leader silent, starting election");

        if self.has_majority(1) {
            self.become_leader(term);
            return;
        }

        let request = Packet::VoteRequest {
            sender: self.username().to_string(),
            term,
            last_index: self.log.last_index(),
            last_term: self.log.last_term(),
        };
        for (_, address) in peers {
            self.transport.send(&request, address).await;
        }
    }

    /// Decides a vote request. The caller has already adopted `term` if newer.
    /// `last` is the candidate's last entry as `(term, index)`.
    pub(crate) fn consider_vote(&self, candidate: &str, term: u64, last: (u64, i64)) -> bool {
        if term < self.term() {
            return false;
        }
        let own = (self.log.last_term(), self.log.last_index());
        if last < own {
            debug!(
                %candidate,
                last_term = last.0,
                last_index = last.1,
                "refusing vote to candidate with an older log"
            );
            return false;
        }
        let granted = self.election.grant(candidate, term);
        if granted {
            self.election.contact();
        }
        granted
    }

    pub(crate) fn tally_vote(self: &Arc<Self>, voter: &str, term: u64) {
        if self.state() != MembershipState::Candidate || term != self.term() {
            return;
        }
        let votes = self.election.record_vote(voter, term);
        debug!(%voter, term, votes, "vote granted");
        if self.has_majority(votes) {
            self.become_leader(term);
        }
    }

    fn has_majority(&self, votes: usize) -> bool {
        let members = self.sessions.peers_of(self.username()).len() + 1;
        votes > members / 2
    }

    fn become_leader(self: &Arc<Self>, term: u64) {
        if !self
            .state
            .transition(MembershipState::Candidate, MembershipState::Leader)
        {
            return;
        }
        let me = self.username().to_string();
        self.set_leader_name(Some(me.clone()));

        for (_, session) in self.sessions.others(&me) {
            if matches!(
                session.state(),
                MembershipState::Leader | MembershipState::Candidate
            ) {
                session.set_state(MembershipState::Follower);
            }
            session.touch();
        }
        let own = Session::new(self.advertise(), MembershipState::Leader);
        own.record_ack(self.log.last_index());
        self.sessions.put(me, own);
        self.buffer.clear();

        self.spawn_leader_tasks();
        info!(term, log_len = self.log.len(), "won election, now leading");
    }

    /// Returns to FOLLOWER from LEADER or CANDIDATE and restarts the
    /// follower-side tasks.
    pub(crate) fn become_follower(self: &Arc<Self>) {
        if self
            .state
            .transition(MembershipState::Candidate, MembershipState::Follower)
        {
            follower::spawn(self, self.role_token());
        } else if self
            .state
            .transition(MembershipState::Leader, MembershipState::Follower)
        {
            if let Some(own) = self.sessions.get(self.username()) {
                own.set_state(MembershipState::Follower);
            }
            let dropped = self.drain_pending();
            if dropped > 0 {
                warn!(dropped, "stepped down with pending actions, dropping them");
            }
            self.spawn_follower_tasks();
        }
        self.election.contact();
    }

    /// Adopts a newer term seen on any packet. Leaders and candidates step
    /// down. Returns whether the term moved.
    pub(crate) fn observe_higher_term(self: &Arc<Self>, term: u64) -> bool {
        if !self.election.observe_term(term) {
            return false;
        }
        info!(term, "observed newer term");
        if matches!(
            self.state(),
            MembershipState::Leader | MembershipState::Candidate
        ) {
            self.become_follower();
        }
        self.set_leader_name(None);
        true
    }

    /// Handles the term on a leader-originated packet. Returns false if the
    /// packet should be ignored.
    pub(crate) fn accept_leader(self: &Arc<Self>, sender: &str, term: u64) -> bool {
        let current = self.term();
        if term < current {
            return false;
        }
        if term > current {
            self.election.observe_term(term);
        }
        match self.state() {
            MembershipState::Leader if term == current => {
                warn!(%sender, term, "another leader claims this term, ignoring it");
                return false;
            }
            MembershipState::Leader | MembershipState::Candidate => self.become_follower(),
            MembershipState::Follower => {}
            MembershipState::PendingFollower => return false,
        }
        self.follow(sender, term);
        true
    }

    fn follow(&self, leader: &str, term: u64) {
        if self.agreement.follow(term, self.log.commit_index()) {
            // Anything buffered came from an earlier leader.
            self.buffer.clear();
        }
        if self.leader().as_deref() != Some(leader) {
            self.set_leader_name(Some(leader.to_string()));
            for (_, session) in self.sessions.others(leader) {
                session.transition(MembershipState::Leader, MembershipState::Follower);
            }
            if let Some(session) = self.sessions.get(leader) {
                session.set_state(MembershipState::Leader);
            }
            info!(%leader, term, "following leader");
        }
        self.election.contact();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> TimerConfig {
        TimerConfig {
            election_timeout: Duration::from_millis(40),
            election_jitter: Duration::ZERO,
            ..TimerConfig::default()
        }
    }

    #[test]
    fn one_vote_per_term() {
        let election = ElectionState::new(&quick());
        assert!(election.grant("a", 2));
        assert!(election.grant("a", 2), "repeat requests keep the vote");
        assert!(!election.grant("b", 2));
        assert!(election.grant("b", 3));
        assert!(!election.grant("a", 2), "older terms are refused");
    }

    #[test]
    fn candidacy_counts_votes_for_its_own_term() {
        let election = ElectionState::new(&quick());
        election.observe_term(4);
        let term = election.begin("me");
        assert_eq!(term, 5);
        assert!(!election.grant("other", 5), "already voted for ourselves");

        assert_eq!(election.record_vote("a", 5), 2);
        assert_eq!(election.record_vote("a", 5), 2, "duplicate votes count once");
        assert_eq!(election.record_vote("b", 4), 0);
        assert_eq!(election.record_vote("b", 5), 3);
    }

    #[test]
    fn terms_only_move_forward() {
        let election = ElectionState::new(&quick());
        assert!(election.observe_term(3));
        assert!(!election.observe_term(2));
        assert!(!election.observe_term(3));
        assert_eq!(election.term(), 3);
    }

    #[test]
    fn deadline_follows_contact() {
        let election = ElectionState::new(&quick());
        let now = Instant::now();
        assert!(!election.is_due(now));
        assert!(election.is_due(now + Duration::from_millis(100)));

        std::thread::sleep(Duration::from_millis(60));
        election.contact();
        assert!(!election.is_due(Instant::now()));
    }
}

//! Per-peer membership and liveness records.
//!
//! The table is a concurrent map keyed by username. Each session's fields are
//! individually atomic so the receiver, the schedulers and the confirmer can
//! touch different fields of the same session without a table-wide lock.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

/// Role of a node in the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MembershipState {
    Leader = 0,
    Follower = 1,
    /// Recorded by the leader but not yet admitted.
    PendingFollower = 2,
    /// Campaigning for leadership after the leader went quiet.
    Candidate = 3,
}

impl MembershipState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => MembershipState::Leader,
            1 => MembershipState::Follower,
            3 => MembershipState::Candidate,
            _ => MembershipState::PendingFollower,
        }
    }

    /// Whether a session in this state counts towards quorums and elections.
    pub fn is_member(self) -> bool {
        !matches!(self, MembershipState::PendingFollower)
    }
}

impl fmt::Display for MembershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MembershipState::Leader => "LEADER",
            MembershipState::Follower => "FOLLOWER",
            MembershipState::PendingFollower => "PENDING_FOLLOWER",
            MembershipState::Candidate => "CANDIDATE",
        };
        f.write_str(name)
    }
}

/// A membership state that can only be changed through compare-and-set.
#[derive(Debug)]
pub struct AtomicMembership(AtomicU8);

impl AtomicMembership {
    pub fn new(state: MembershipState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> MembershipState {
        MembershipState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: MembershipState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves from `from` to `to`; returns false if the current state was not `from`.
    pub fn transition(&self, from: MembershipState, to: MembershipState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Bookkeeping for one peer.
#[derive(Debug)]
pub struct Session {
    address: SocketAddr,
    state: AtomicMembership,
    last_message: Mutex<Instant>,
    greatest_ack: AtomicI64,
    timed_out: AtomicBool,
}

impl Session {
    pub fn new(address: SocketAddr, state: MembershipState) -> Self {
        Self {
            address,
            state: AtomicMembership::new(state),
            last_message: Mutex::new(Instant::now()),
            greatest_ack: AtomicI64::new(-1),
            timed_out: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> MembershipState {
        self.state.load()
    }

    pub fn set_state(&self, state: MembershipState) {
        self.state.store(state);
    }

    pub fn transition(&self, from: MembershipState, to: MembershipState) -> bool {
        self.state.transition(from, to)
    }

    /// Records that a message just arrived from this peer.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&self, now: Instant) {
        *self.last_message.lock() = now;
        self.timed_out.store(false, Ordering::Release);
    }

    pub fn last_message(&self) -> Instant {
        *self.last_message.lock()
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    pub fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::Release);
    }

    pub fn greatest_acknowledged(&self) -> i64 {
        self.greatest_ack.load(Ordering::Acquire)
    }

    /// Raises the acknowledged index. Acks can arrive out of order, so a lower
    /// index never overwrites a higher one. Returns whether the value changed.
    pub fn record_ack(&self, index: i64) -> bool {
        self.greatest_ack.fetch_max(index, Ordering::AcqRel) < index
    }
}

/// A point-in-time copy of a session for status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub username: String,
    pub address: SocketAddr,
    pub state: MembershipState,
    pub greatest_acknowledged: i64,
    pub timed_out: bool,
}

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, username: &str) -> Option<Arc<Session>> {
        self.sessions.get(username).map(|s| Arc::clone(s.value()))
    }

    pub fn contains(&self, username: &str) -> bool {
        self.sessions.contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Inserts or replaces a session unconditionally.
    pub fn put(&self, username: impl Into<String>, session: Session) {
        self.sessions.insert(username.into(), Arc::new(session));
    }

    /// Inserts only if no session exists for `username`. Returns whether it inserted.
    pub fn insert_if_absent(&self, username: impl Into<String>, session: Session) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.sessions.entry(username.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(session));
                true
            }
        }
    }

    /// Records a join request: a new PENDING_FOLLOWER session, unless the
    /// user is already known.
    pub fn add_user(&self, username: impl Into<String>, address: SocketAddr) -> bool {
        self.insert_if_absent(username, Session::new(address, MembershipState::PendingFollower))
    }

    /// Admits a peer. An existing PENDING_FOLLOWER is promoted to FOLLOWER and
    /// refreshed; any other existing session is left untouched apart from a
    /// timestamp refresh; an unknown user gets `session` as-is.
    /// Returns true if a pending session was promoted.
    pub fn add_session(&self, username: impl Into<String>, session: Session) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.sessions.entry(username.into()) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                existing.touch();
                existing.transition(MembershipState::PendingFollower, MembershipState::Follower)
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(session));
                false
            }
        }
    }

    /// Refreshes a peer's timestamp and clears its timed-out flag.
    pub fn touch(&self, username: &str) -> bool {
        match self.get(username) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Updates a FOLLOWER's acknowledged index. Returns whether it advanced.
    pub fn record_ack(&self, username: &str, index: i64) -> bool {
        match self.get(username) {
            Some(session) if session.state() == MembershipState::Follower => {
                session.record_ack(index)
            }
            _ => false,
        }
    }

    /// Addresses that should receive the leader's broadcast: live followers.
    pub fn broadcast_targets(&self) -> Vec<SocketAddr> {
        self.sessions
            .iter()
            .filter(|s| s.state() == MembershipState::Follower && !s.is_timed_out())
            .map(|s| s.address())
            .collect()
    }

    /// Marks every live FOLLOWER that has been silent for longer than
    /// `threshold` as timed out and returns their usernames.
    pub fn expire_stale(&self, now: Instant, threshold: Duration) -> Vec<String> {
        let mut expired = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.state() != MembershipState::Follower || session.is_timed_out() {
                continue;
            }
            if now.saturating_duration_since(session.last_message()) > threshold {
                session.mark_timed_out();
                expired.push(entry.key().clone());
            }
        }
        expired
    }

    /// Acknowledged indexes of every member that is not timed out.
    pub fn live_acks(&self) -> Vec<i64> {
        self.sessions
            .iter()
            .filter(|s| s.state().is_member() && !s.is_timed_out())
            .map(|s| s.greatest_acknowledged())
            .collect()
    }

    /// Usernames and addresses of every member other than `me`.
    pub fn peers_of(&self, me: &str) -> Vec<(String, SocketAddr)> {
        self.sessions
            .iter()
            .filter(|s| s.key() != me && s.state().is_member())
            .map(|s| (s.key().clone(), s.address()))
            .collect()
    }

    /// Every session other than `me`.
    pub fn others(&self, me: &str) -> Vec<(String, Arc<Session>)> {
        self.sessions
            .iter()
            .filter(|s| s.key() != me)
            .map(|s| (s.key().clone(), Arc::clone(s.value())))
            .collect()
    }

    pub fn views(&self) -> Vec<SessionView> {
        let mut views: Vec<SessionView> = self
            .sessions
            .iter()
            .map(|s| SessionView {
                username: s.key().clone(),
                address: s.address(),
                state: s.state(),
                greatest_acknowledged: s.greatest_acknowledged(),
                timed_out: s.is_timed_out(),
            })
            .collect();
        views.sort_by(|a, b| a.username.cmp(&b.username));
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn add_user_admits_at_most_once() {
        let table = SessionTable::new();
        assert!(table.add_user("alice", addr(1)));
        assert!(!table.add_user("alice", addr(2)));
        assert_eq!(table.len(), 1);

        let session = table.get("alice").unwrap();
        assert_eq!(session.address(), addr(1));
        assert_eq!(session.state(), MembershipState::PendingFollower);
    }

    #[test]
    fn add_session_promotes_pending_follower() {
        let table = SessionTable::new();
        table.add_user("bob", addr(1));
        let before = table.get("bob").unwrap().last_message();

        std::thread::sleep(Duration::from_millis(2));
        let promoted = table.add_session("bob", Session::new(addr(9), MembershipState::Follower));
        assert!(promoted);

        let session = table.get("bob").unwrap();
        assert_eq!(session.state(), MembershipState::Follower);
        // The original record is kept, only promoted.
        assert_eq!(session.address(), addr(1));
        assert!(session.last_message() > before);
    }

    #[test]
    fn add_session_on_follower_only_refreshes() {
        let table = SessionTable::new();
        table.put("carol", Session::new(addr(1), MembershipState::Follower));
        let session = table.get("carol").unwrap();
        session.mark_timed_out();
        let before = session.last_message();

        std::thread::sleep(Duration::from_millis(2));
        let promoted = table.add_session("carol", Session::new(addr(1), MembershipState::Leader));
        assert!(!promoted);
        assert_eq!(session.state(), MembershipState::Follower);
        assert!(session.last_message() > before);
        assert!(!session.is_timed_out());
    }

    #[test]
    fn add_session_inserts_unknown_user_as_given() {
        let table = SessionTable::new();
        table.add_session("dave", Session::new(addr(4), MembershipState::Leader));
        assert_eq!(table.get("dave").unwrap().state(), MembershipState::Leader);
    }

    #[test]
    fn stale_followers_time_out_and_recover() {
        let table = SessionTable::new();
        table.put("leader", Session::new(addr(1), MembershipState::Leader));
        table.put("fresh", Session::new(addr(2), MembershipState::Follower));
        table.put("stale", Session::new(addr(3), MembershipState::Follower));

        let now = Instant::now();
        table.get("fresh").unwrap().touch_at(now + Duration::from_millis(250));

        let expired = table.expire_stale(now + Duration::from_millis(300), Duration::from_millis(200));
        assert_eq!(expired, vec!["stale".to_string()]);
        assert!(table.get("stale").unwrap().is_timed_out());
        // Leaders are never timed out by the liveness check.
        assert!(!table.get("leader").unwrap().is_timed_out());

        let targets = table.broadcast_targets();
        assert_eq!(targets, vec![addr(2)]);

        // Already timed out: not reported twice.
        let later = table.expire_stale(now + Duration::from_millis(900), Duration::from_millis(200));
        assert_eq!(later, vec!["fresh".to_string()]);

        assert!(table.touch("stale"));
        assert!(!table.get("stale").unwrap().is_timed_out());
        assert!(table.broadcast_targets().contains(&addr(3)));
    }

    #[test]
    fn acks_never_move_backwards() {
        let table = SessionTable::new();
        table.put("f", Session::new(addr(1), MembershipState::Follower));
        table.add_user("p", addr(2));

        assert!(table.record_ack("f", 4));
        assert!(!table.record_ack("f", 2));
        assert_eq!(table.get("f").unwrap().greatest_acknowledged(), 4);
        // Pending and unknown users are not tracked.
        assert!(!table.record_ack("p", 1));
        assert!(!table.record_ack("ghost", 1));
    }

    #[test]
    fn membership_transitions_are_compare_and_set() {
        let state = AtomicMembership::new(MembershipState::PendingFollower);
        assert!(!state.transition(MembershipState::Follower, MembershipState::Leader));
        assert!(state.transition(MembershipState::PendingFollower, MembershipState::Follower));
        assert_eq!(state.load(), MembershipState::Follower);
    }
}

//! The replication node: role, pending queue, schedulers and client API.
//!
//! A [`RaftNode`] owns every piece of shared state (session table, action
//! log, out-of-order buffer, pending queue) and every background task works
//! through an `Arc` to it. Several nodes can live in one process.
//!
//! Background tasks:
//!
//! - **receiver**: always running; decrypts, decodes and dispatches datagrams
//! - **applier**: always running once in a group; feeds committed entries to
//!   the [`StateMachine`]
//! - **leader role**: heartbeat scheduler, liveness checker, log confirmer
//! - **follower role**: log maintainer, election checker, hello retry
//!
//! Role tasks run under a child cancellation token that is replaced on every
//! role change, so stepping down stops the old role's tasks.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, ensure};
use crossbeam_channel::{Receiver, Sender, unbounded};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::action::{Action, AdminCommand, LogEntry};
use crate::applier::{self, StateMachine};
use crate::config::{NodeConfig, TimerConfig};
use crate::confirmer;
use crate::crypto::Encryption;
use crate::election::ElectionState;
use crate::follower::{self, LeaderAgreement, LeaderEntry};
use crate::log::ActionLog;
use crate::packet::Packet;
use crate::receiver;
use crate::scheduler::spawn_periodic;
use crate::session::{AtomicMembership, MembershipState, Session, SessionTable, SessionView};
use crate::transport::{Transport, fits_datagram};

/// Snapshot of a node's state for the console's STATUS command.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub username: String,
    pub state: MembershipState,
    pub leader: Option<String>,
    pub term: u64,
    pub log_len: u64,
    pub commit_index: i64,
    /// First local entry found to differ from the leader's log, if any.
    pub log_conflict: Option<u64>,
    pub sessions: Vec<SessionView>,
}

pub struct RaftNode {
    username: String,
    advertise: SocketAddr,
    pub(crate) timers: TimerConfig,
    pub(crate) transport: Transport,
    pub(crate) sessions: SessionTable,
    pub(crate) log: ActionLog,
    /// Entries received ahead of the follower's log length, keyed by index.
    pub(crate) buffer: DashMap<u64, LeaderEntry>,
    pub(crate) agreement: LeaderAgreement,
    pending_tx: Sender<Action>,
    pending_rx: Receiver<Action>,
    pub(crate) state: AtomicMembership,
    leader: RwLock<Option<String>>,
    pub(crate) election: ElectionState,
    join_target: Mutex<Option<SocketAddr>>,
    active: AtomicBool,
    pub(crate) confirmer_wake: Notify,
    pub(crate) maintainer_wake: Notify,
    pub(crate) maintainer_epoch: AtomicU64,
    shutdown: CancellationToken,
    role: Mutex<CancellationToken>,
    pub(crate) tasks: TaskTracker,
    pub(crate) state_machine: Arc<dyn StateMachine>,
}

impl RaftNode {
    /// Binds the node's UDP endpoint and starts its receiver.
    ///
    /// The node is not part of any group until [`RaftNode::start_group`] or
    /// [`RaftNode::join_group`] is called. Must be called inside a tokio runtime.
    pub async fn bind(config: NodeConfig, state_machine: Arc<dyn StateMachine>) -> Result<Arc<Self>> {
        let transport = Transport::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind UDP socket on {}", config.listen))?;
        let advertise = config
            .advertise
            .unwrap_or_else(|| reachable_address(transport.local_addr()));
        let (pending_tx, pending_rx) = unbounded();
        let shutdown = CancellationToken::new();
        let role = shutdown.child_token();

        let node = Arc::new(Self {
            username: config.username,
            advertise,
            election: ElectionState::new(&config.timers),
            timers: config.timers,
            transport,
            sessions: SessionTable::new(),
            log: ActionLog::new(),
            buffer: DashMap::new(),
            agreement: LeaderAgreement::new(),
            pending_tx,
            pending_rx,
            state: AtomicMembership::new(MembershipState::PendingFollower),
            leader: RwLock::new(None),
            join_target: Mutex::new(None),
            active: AtomicBool::new(true),
            confirmer_wake: Notify::new(),
            maintainer_wake: Notify::new(),
            maintainer_epoch: AtomicU64::new(0),
            shutdown,
            role: Mutex::new(role),
            tasks: TaskTracker::new(),
            state_machine,
        });

        receiver::spawn(&node)?;
        info!(
            username = %node.username,
            addr = %node.transport.local_addr(),
            "node bound"
        );
        Ok(node)
    }

    /// Creates a new group with this node as its leader.
    pub fn start_group(self: &Arc<Self>) -> Result<()> {
        ensure!(
            self.state
                .transition(MembershipState::PendingFollower, MembershipState::Leader),
            "{} is already part of a group",
            self.username
        );

        self.transport.crypto().generate_group_secret();
        self.election.observe_term(1);
        *self.leader.write() = Some(self.username.clone());
        self.enqueue(Action::admin(
            &self.username,
            &AdminCommand::AddMember {
                username: self.username.clone(),
                joined_at_ms: unix_millis(),
                address: self.advertise,
            },
        ));
        self.sessions
            .put(&self.username, Session::new(self.advertise, MembershipState::Leader));

        self.spawn_leader_tasks();
        applier::spawn(self);
        info!(username = %self.username, addr = %self.advertise, "started group as leader");
        Ok(())
    }

    /// Asks the member at `group` to admit this node.
    ///
    /// The hello is resent until the group secret arrives. Fails if the first
    /// hello cannot be sent; the node is then left half-joined and should be
    /// shut down with [`RaftNode::exit_group`].
    pub async fn join_group(self: &Arc<Self>, group: SocketAddr) -> Result<()> {
        ensure!(
            self.state
                .transition(MembershipState::PendingFollower, MembershipState::Follower),
            "{} is already part of a group",
            self.username
        );
        *self.join_target.lock() = Some(group);

        applier::spawn(self);
        self.spawn_follower_tasks();
        self.send_hello(group)
            .await
            .with_context(|| format!("failed to send hello to {group}"))?;
        info!(username = %self.username, %group, "join requested");
        Ok(())
    }

    /// Submits an action for global ordering.
    ///
    /// On the leader it is queued locally; elsewhere it is forwarded to the
    /// leader. With no known leader the action is dropped. Fire-and-forget:
    /// watch the applied history to see it land.
    pub async fn submit_action(&self, command: impl Into<String>) {
        let command = command.into();
        if self.state() == MembershipState::Leader {
            self.enqueue_player(&self.username, command);
            return;
        }

        match self.leader_address() {
            Some(leader) => {
                let packet = Packet::ReqCommand {
                    sender: self.username.clone(),
                    command,
                };
                self.transport.send(&packet, leader).await;
            }
            None => debug!(%command, "no leader known, dropping action"),
        }
    }

    /// Records a join request. Returns false if the user was already known.
    pub fn add_user(&self, username: &str, address: SocketAddr) -> bool {
        self.sessions.add_user(username, address)
    }

    /// Admits a peer; see [`SessionTable::add_session`].
    pub fn add_session(&self, username: &str, session: Session) -> bool {
        self.sessions.add_session(username, session)
    }

    /// Records `username` as the leader, replacing any session under that name.
    pub fn set_leader(&self, username: &str, session: Session) {
        self.sessions.put(username, session);
        *self.leader.write() = Some(username.to_string());
    }

    /// Advances the commit index; never regresses it. Returns whether it moved.
    pub fn commit_action(&self, index: i64) -> bool {
        self.log.commit(index)
    }

    /// Waits until `index` is committed. Returns false if the node shut down first.
    pub async fn wait_committed(&self, index: i64) -> bool {
        tokio::select! {
            biased;
            _ = self.log.wait_for_commit(index) => true,
            _ = self.shutdown.cancelled() => false,
        }
    }

    /// Stops every task, wakes every waiter and releases the socket.
    /// Calls after the first are no-ops.
    pub async fn exit_group(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(username = %self.username, "leaving group");

        self.shutdown.cancel();
        self.confirmer_wake.notify_one();
        self.maintainer_wake.notify_one();
        self.log.notify();
        self.transport.close();

        self.tasks.close();
        self.tasks.wait().await;
        debug!(username = %self.username, "all tasks stopped");
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn state(&self) -> MembershipState {
        self.state.load()
    }

    pub fn term(&self) -> u64 {
        self.election.term()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn leader(&self) -> Option<String> {
        self.leader.read().clone()
    }

    pub fn leader_address(&self) -> Option<SocketAddr> {
        let leader = self.leader.read().clone()?;
        self.sessions.get(&leader).map(|s| s.address())
    }

    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn commit_index(&self) -> i64 {
        self.log.commit_index()
    }

    /// First local entry found to differ from the current leader's log.
    /// Nothing from that index on is acknowledged or committed here.
    pub fn log_conflict(&self) -> Option<u64> {
        self.agreement.conflict()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            username: self.username.clone(),
            state: self.state(),
            leader: self.leader(),
            term: self.term(),
            log_len: self.log.len(),
            commit_index: self.log.commit_index(),
            log_conflict: self.log_conflict(),
            sessions: self.sessions.views(),
        }
    }

    /// Marks followers that have gone quiet as timed out. Returns their names.
    pub fn check_liveness(&self, now: Instant) -> Vec<String> {
        let expired = self.sessions.expire_stale(now, self.timers.liveness_threshold);
        for username in &expired {
            info!(%username, "follower timed out");
        }
        expired
    }

    pub(crate) fn advertise(&self) -> SocketAddr {
        self.advertise
    }

    pub(crate) fn crypto(&self) -> &Encryption {
        self.transport.crypto()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn set_leader_name(&self, leader: Option<String>) {
        *self.leader.write() = leader;
    }

    pub(crate) fn enqueue(&self, action: Action) {
        // The receiver half lives as long as the node, so this cannot fail.
        let _ = self.pending_tx.send(action);
    }

    /// Queues a player action. Commands that would read back as membership
    /// changes, or that could not be replicated in one datagram, are refused.
    pub(crate) fn enqueue_player(&self, username: &str, command: String) {
        if AdminCommand::parse(&command).is_some() {
            warn!(%username, "action mimics a membership command, dropping it");
            return;
        }
        let action = Action::new(username, command);
        if !self.fits_log_command(&action) {
            warn!(
                %username,
                len = action.command.len(),
                "action too large to replicate, dropping it"
            );
            return;
        }
        self.enqueue(action);
    }

    /// Integers encode at a fixed width, so the size does not depend on the
    /// log position the action ends up at.
    fn fits_log_command(&self, action: &Action) -> bool {
        fits_datagram(&Packet::LogCommand {
            sender: self.username.clone(),
            term: 0,
            index: 0,
            entry_term: 0,
            prev_term: 0,
            leader_commit: 0,
            action: action.clone(),
        })
    }

    /// Admits a pending follower whose first sealed packet just arrived and
    /// records the membership change in the log.
    pub(crate) fn admit(&self, username: &str, address: SocketAddr) {
        if !self
            .sessions
            .add_session(username, Session::new(address, MembershipState::Follower))
        {
            return;
        }
        self.enqueue(Action::admin(
            &self.username,
            &AdminCommand::AddMember {
                username: username.to_string(),
                joined_at_ms: unix_millis(),
                address,
            },
        ));
        info!(%username, %address, "member admitted");
    }

    /// Reacts to an entry a follower just appended.
    pub(crate) fn observe_entry(&self, entry: &LogEntry) {
        let Some(AdminCommand::AddMember {
            username, address, ..
        }) = entry.action.as_admin()
        else {
            return;
        };
        if self.leader.read().as_deref() == Some(username.as_str()) {
            return;
        }
        if self
            .sessions
            .insert_if_absent(&username, Session::new(address, MembershipState::Follower))
        {
            debug!(%username, %address, index = entry.index, "learned group member");
        }
    }

    fn next_role_token(&self) -> CancellationToken {
        let mut role = self.role.lock();
        role.cancel();
        *role = self.shutdown.child_token();
        role.clone()
    }

    pub(crate) fn role_token(&self) -> CancellationToken {
        self.role.lock().clone()
    }

    pub(crate) fn spawn_leader_tasks(self: &Arc<Self>) {
        let token = self.next_role_token();

        let node = Arc::clone(self);
        spawn_periodic(
            &self.tasks,
            "heartbeat",
            self.timers.heartbeat_interval,
            token.clone(),
            move || {
                let node = Arc::clone(&node);
                async move { node.heartbeat_tick().await }
            },
        );

        let node = Arc::clone(self);
        spawn_periodic(
            &self.tasks,
            "liveness",
            self.timers.liveness_check_interval,
            token.clone(),
            move || {
                let node = Arc::clone(&node);
                async move {
                    node.check_liveness(Instant::now());
                }
            },
        );

        confirmer::spawn(self, token);
    }

    pub(crate) fn spawn_follower_tasks(self: &Arc<Self>) {
        let token = self.next_role_token();

        follower::spawn(self, token.clone());

        let node = Arc::clone(self);
        spawn_periodic(
            &self.tasks,
            "election",
            self.timers.election_check_interval,
            token.clone(),
            move || {
                let node = Arc::clone(&node);
                async move { node.election_tick().await }
            },
        );

        let node = Arc::clone(self);
        spawn_periodic(
            &self.tasks,
            "hello-retry",
            self.timers.hello_retry_interval,
            token,
            move || {
                let node = Arc::clone(&node);
                async move { node.hello_tick().await }
            },
        );
    }

    /// One leader tick: append at most one pending action and broadcast it,
    /// or broadcast a heartbeat when the queue is empty.
    pub(crate) async fn heartbeat_tick(&self) {
        if self.state() != MembershipState::Leader {
            return;
        }
        let term = self.term();
        let packet = match self.pending_rx.try_recv() {
            Ok(action) => {
                let leader_commit = self.log.commit_index();
                let prev_term = self.log.last_term();
                let index = self.log.append(term, action.clone());
                if let Some(me) = self.sessions.get(&self.username) {
                    me.record_ack(index as i64);
                }
                debug!(index, username = %action.username, "appended action");
                Packet::LogCommand {
                    sender: self.username.clone(),
                    term,
                    index,
                    entry_term: term,
                    prev_term,
                    leader_commit,
                    action,
                }
            }
            Err(_) => Packet::Heartbeat {
                sender: self.username.clone(),
                term,
                commit_index: self.log.commit_index(),
            },
        };

        for target in self.sessions.broadcast_targets() {
            self.transport.send(&packet, target).await;
        }

        // Covers a confirmer wake that was missed between acks.
        self.confirmer_wake.notify_one();
    }

    async fn hello_tick(&self) {
        if self.state() != MembershipState::Follower || self.crypto().has_group_secret() {
            return;
        }
        let Some(target) = *self.join_target.lock() else {
            return;
        };
        if let Err(err) = self.send_hello(target).await {
            warn!(%target, error = %err, "failed to resend hello");
        }
    }

    async fn send_hello(&self, group: SocketAddr) -> std::io::Result<()> {
        let hello = Packet::ClientHello {
            sender: self.username.clone(),
            public_key: self.crypto().public_key(),
        };
        self.transport.send_handshake(&hello, group).await
    }

    /// Tells `to` how far this node's log is known to match the leader's.
    pub(crate) async fn send_ack_to(&self, to: SocketAddr) {
        let ack = Packet::Ack {
            sender: self.username.clone(),
            term: self.term(),
            greatest_index: self.agreement.verified(),
        };
        self.transport.send(&ack, to).await;
    }

    pub(crate) async fn send_ack(&self) {
        if let Some(leader) = self.leader_address() {
            self.send_ack_to(leader).await;
        }
    }

    /// Retransmits entries a lagging follower is missing.
    pub(crate) async fn catch_up(&self, to: SocketAddr, greatest_index: i64) {
        if greatest_index >= self.log.last_index() {
            return;
        }
        let start = (greatest_index + 1).max(0) as u64;
        let Some(mut prev_term) = self.log.term_before(start) else {
            return;
        };
        let term = self.term();
        let leader_commit = self.log.commit_index();
        for entry in self.log.range(start, self.timers.catch_up_batch) {
            let packet = Packet::LogCommand {
                sender: self.username.clone(),
                term,
                index: entry.index,
                entry_term: entry.term,
                prev_term,
                leader_commit,
                action: entry.action,
            };
            prev_term = entry.term;
            self.transport.send(&packet, to).await;
        }
    }

    /// Advances the commit index toward the leader's, but never past the
    /// part of the log known to match the leader's.
    pub(crate) fn commit_verified(&self, leader_commit: i64) -> bool {
        self.log.commit(leader_commit.min(self.agreement.verified()))
    }

    /// Drops whatever is left in the pending queue after losing leadership.
    pub(crate) fn drain_pending(&self) -> usize {
        self.pending_rx.try_iter().count()
    }
}

/// Peers cannot reach an unspecified address, so fall back to loopback on
/// the bound port. Nodes on other hosts need an explicit advertise address.
fn reachable_address(bound: SocketAddr) -> SocketAddr {
    if !bound.ip().is_unspecified() {
        return bound;
    }
    let loopback = match bound.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    };
    warn!(%bound, "no advertise address given, advertising loopback");
    SocketAddr::new(loopback, bound.port())
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

//! Inbound datagram loop and per-packet handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace, warn};

use crate::crypto::{KEY_SIZE, WrappedSecret};
use crate::follower::LeaderEntry;
use crate::node::RaftNode;
use crate::packet::Packet;
use crate::session::{MembershipState, Session};
use crate::transport::MAX_DATAGRAM;

pub(crate) fn spawn(node: &Arc<RaftNode>) -> Result<()> {
    let socket = node
        .transport
        .socket()
        .ok_or_else(|| anyhow!("transport closed before the receiver started"))?;
    node.tasks.spawn(run(Arc::clone(node), socket));
    Ok(())
}

async fn run(node: Arc<RaftNode>, socket: Arc<UdpSocket>) {
    let cancel = node.shutdown_token();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    debug!(addr = %node.local_addr(), "receiver started");

    loop {
        let (len, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(err) => {
                    // ICMP unreachable from a departed peer surfaces here on some platforms.
                    debug!(error = %err, "receive failed");
                    continue;
                }
            },
        };

        let packet = match node.transport.open(&buf[..len]) {
            Ok(packet) => packet,
            Err(err) => {
                trace!(%from, error = %err, "dropping datagram");
                continue;
            }
        };
        dispatch(&node, packet, from).await;
    }
    debug!("receiver stopped");
}

pub(crate) async fn dispatch(node: &Arc<RaftNode>, packet: Packet, from: SocketAddr) {
    trace!(kind = packet.kind(), sender = packet.sender(), %from, "packet received");
    match packet {
        Packet::ClientHello { sender, public_key } => {
            on_hello(node, sender, public_key, from).await
        }
        Packet::GroupSecretReply {
            sender,
            public_key,
            term,
            nonce,
            sealed_secret,
        } => {
            let wrapped = WrappedSecret {
                nonce,
                sealed: sealed_secret,
            };
            on_secret_reply(node, sender, public_key, term, wrapped, from).await
        }
        packet => on_member_packet(node, packet, from).await,
    }
}

async fn on_hello(node: &Arc<RaftNode>, sender: String, public_key: [u8; KEY_SIZE], from: SocketAddr) {
    if node.state() != MembershipState::Leader {
        debug!(%sender, %from, "not the leader, ignoring hello");
        return;
    }
    if sender == node.username() {
        return;
    }

    let recorded = node.add_user(&sender, from);
    if !recorded {
        let still_pending = node
            .sessions
            .get(&sender)
            .is_some_and(|s| s.state() == MembershipState::PendingFollower);
        if !still_pending {
            warn!(%sender, %from, "hello reuses the name of a group member, ignoring");
            return;
        }
    }

    let wrapped = match node.crypto().wrap_group_secret(&public_key) {
        Ok(wrapped) => wrapped,
        Err(err) => {
            warn!(%sender, error = %err, "could not seal group secret for joiner");
            return;
        }
    };
    let reply = Packet::GroupSecretReply {
        sender: node.username().to_string(),
        public_key: node.crypto().public_key(),
        term: node.term(),
        nonce: wrapped.nonce,
        sealed_secret: wrapped.sealed,
    };
    if let Err(err) = node.transport.send_handshake(&reply, from).await {
        warn!(%sender, %from, error = %err, "failed to send group secret");
        return;
    }
    if recorded {
        info!(%sender, %from, "join request recorded");
    }
}

async fn on_secret_reply(
    node: &Arc<RaftNode>,
    sender: String,
    public_key: [u8; KEY_SIZE],
    term: u64,
    wrapped: WrappedSecret,
    from: SocketAddr,
) {
    if node.state() != MembershipState::Follower || node.crypto().has_group_secret() {
        trace!(%sender, "ignoring group secret reply");
        return;
    }
    if let Err(err) = node.crypto().unwrap_group_secret(&public_key, &wrapped) {
        warn!(%sender, %from, error = %err, "rejected group secret");
        return;
    }

    node.election.observe_term(term);
    node.set_leader(&sender, Session::new(from, MembershipState::Leader));
    node.election.contact();
    info!(leader = %sender, term, "admitted to group");

    // The first sealed packet the leader sees from us completes the join.
    node.send_ack_to(from).await;
}

async fn on_member_packet(node: &Arc<RaftNode>, packet: Packet, from: SocketAddr) {
    let sender = packet.sender().to_string();
    let Some(session) = node.sessions.get(&sender) else {
        debug!(%sender, kind = packet.kind(), "packet from unknown sender, ignoring");
        return;
    };
    session.touch();
    if node.state() == MembershipState::Leader
        && session.state() == MembershipState::PendingFollower
    {
        node.admit(&sender, session.address());
    }

    match packet {
        Packet::LogCommand {
            term,
            index,
            entry_term,
            prev_term,
            leader_commit,
            action,
            ..
        } => {
            let entry = LeaderEntry {
                leader_term: term,
                term: entry_term,
                prev_term,
                action,
            };
            on_log_command(node, &sender, index, entry, leader_commit, from).await
        }
        Packet::Heartbeat {
            term, commit_index, ..
        } => on_heartbeat(node, &sender, term, commit_index, from).await,
        Packet::ReqCommand { command, .. } => on_request(node, &sender, command),
        Packet::Ack {
            term,
            greatest_index,
            ..
        } => on_ack(node, &sender, term, greatest_index, from).await,
        Packet::VoteRequest {
            term,
            last_index,
            last_term,
            ..
        } => on_vote_request(node, &sender, term, (last_term, last_index), from).await,
        Packet::VoteReply { term, granted, .. } => {
            if !node.observe_higher_term(term) && granted {
                node.tally_vote(&sender, term);
            }
        }
        Packet::ClientHello { .. } | Packet::GroupSecretReply { .. } => {}
    }
}

async fn on_log_command(
    node: &Arc<RaftNode>,
    sender: &str,
    index: u64,
    entry: LeaderEntry,
    leader_commit: i64,
    from: SocketAddr,
) {
    let term = entry.leader_term;
    if term < node.term() {
        // Our ack carries the newer term and makes a stale leader step down.
        node.send_ack_to(from).await;
        return;
    }
    if !node.accept_leader(sender, term) {
        return;
    }

    let next = node.log.len();
    match node.log.term_at(index) {
        Some(held) if held == entry.term => {
            node.agreement.confirm(term, index);
        }
        Some(held) => {
            if node.agreement.disagree(term, index) {
                error!(
                    index,
                    held,
                    leader_entry = entry.term,
                    "local log differs from the leader's, no longer committing past it"
                );
            }
        }
        None => {
            node.buffer.entry(index).or_insert(entry);
            node.maintainer_wake.notify_one();
        }
    }
    node.commit_verified(leader_commit);

    if index > next {
        trace!(index, next, "gap in leader entries, asking for retransmission");
        node.send_ack_to(from).await;
    }
}

async fn on_heartbeat(node: &Arc<RaftNode>, sender: &str, term: u64, commit_index: i64, from: SocketAddr) {
    if term < node.term() {
        node.send_ack_to(from).await;
        return;
    }
    if !node.accept_leader(sender, term) {
        return;
    }
    node.commit_verified(commit_index);
    node.send_ack_to(from).await;
}

fn on_request(node: &Arc<RaftNode>, sender: &str, command: String) {
    if node.state() != MembershipState::Leader {
        debug!(%sender, "not the leader, dropping forwarded action");
        return;
    }
    node.enqueue_player(sender, command);
}

async fn on_ack(node: &Arc<RaftNode>, sender: &str, term: u64, greatest_index: i64, from: SocketAddr) {
    if node.observe_higher_term(term) || node.state() != MembershipState::Leader {
        return;
    }
    if node.sessions.record_ack(sender, greatest_index) {
        node.confirmer_wake.notify_one();
    }
    node.catch_up(from, greatest_index).await;
}

async fn on_vote_request(
    node: &Arc<RaftNode>,
    sender: &str,
    term: u64,
    last: (u64, i64),
    from: SocketAddr,
) {
    node.observe_higher_term(term);
    let granted = node.consider_vote(sender, term, last);
    debug!(candidate = %sender, term, granted, "vote requested");
    let reply = Packet::VoteReply {
        sender: node.username().to_string(),
        term: node.term(),
        granted,
    };
    node.transport.send(&reply, from).await;
}

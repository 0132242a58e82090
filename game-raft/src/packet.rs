//! Typed packets exchanged between nodes.
//!
//! Encoding is plain `bincode`; confidentiality comes from the envelope in
//! [`crate::transport`], not from this layer.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::crypto::{KEY_SIZE, NONCE_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Joiner → leader. The only packet a node sends before it holds the group secret.
    ClientHello {
        sender: String,
        public_key: [u8; KEY_SIZE],
    },
    /// Leader → joiner. The group secret sealed for the joiner's public key.
    GroupSecretReply {
        sender: String,
        public_key: [u8; KEY_SIZE],
        term: u64,
        nonce: [u8; NONCE_SIZE],
        sealed_secret: Vec<u8>,
    },
    /// Leader → follower. One log entry plus the leader's commit index.
    ///
    /// `entry_term` is the term the entry was appended in, which differs from
    /// `term` for retransmitted entries of earlier leaders. `prev_term` is the
    /// term of the leader's entry at `index - 1`.
    LogCommand {
        sender: String,
        term: u64,
        index: u64,
        entry_term: u64,
        prev_term: u64,
        leader_commit: i64,
        action: Action,
    },
    /// Leader → follower when there is nothing new to append.
    Heartbeat {
        sender: String,
        term: u64,
        commit_index: i64,
    },
    /// Follower → leader. An action submitted on a non-leader node.
    ReqCommand { sender: String, command: String },
    /// Follower → leader. The greatest contiguous index the follower holds.
    Ack {
        sender: String,
        term: u64,
        greatest_index: i64,
    },
    VoteRequest {
        sender: String,
        term: u64,
        last_index: i64,
        last_term: u64,
    },
    VoteReply {
        sender: String,
        term: u64,
        granted: bool,
    },
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Length of [`Packet::encode`]'s output, without encoding.
    pub fn encoded_len(&self) -> Result<u64> {
        Ok(bincode::serialized_size(self)?)
    }

    pub fn sender(&self) -> &str {
        match self {
            Packet::ClientHello { sender, .. }
            | Packet::GroupSecretReply { sender, .. }
            | Packet::LogCommand { sender, .. }
            | Packet::Heartbeat { sender, .. }
            | Packet::ReqCommand { sender, .. }
            | Packet::Ack { sender, .. }
            | Packet::VoteRequest { sender, .. }
            | Packet::VoteReply { sender, .. } => sender,
        }
    }

    /// Handshake packets are the only ones allowed outside the sealed envelope.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Packet::ClientHello { .. } | Packet::GroupSecretReply { .. }
        )
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::ClientHello { .. } => "client_hello",
            Packet::GroupSecretReply { .. } => "group_secret_reply",
            Packet::LogCommand { .. } => "log_command",
            Packet::Heartbeat { .. } => "heartbeat",
            Packet::ReqCommand { .. } => "req_command",
            Packet::Ack { .. } => "ack",
            Packet::VoteRequest { .. } => "vote_request",
            Packet::VoteReply { .. } => "vote_reply",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_command_keeps_its_action() {
        let packet = Packet::LogCommand {
            sender: "leader".into(),
            term: 3,
            index: 7,
            entry_term: 2,
            prev_term: 2,
            leader_commit: 5,
            action: Action::new("alice", "attack goblin"),
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(packet.encoded_len().unwrap(), bytes.len() as u64);
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.sender(), "leader");
        assert!(!decoded.is_handshake());
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(Packet::decode(&[]).is_err());
        assert!(Packet::decode(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }

    #[test]
    fn only_hello_and_reply_are_handshake() {
        let hello = Packet::ClientHello {
            sender: "bob".into(),
            public_key: [7; KEY_SIZE],
        };
        let ack = Packet::Ack {
            sender: "bob".into(),
            term: 1,
            greatest_index: -1,
        };
        assert!(hello.is_handshake());
        assert!(!ack.is_handshake());
        assert_eq!(ack.kind(), "ack");
    }
}

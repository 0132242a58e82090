//! Leader-based replicated action log for peer-to-peer game sessions.
//!
//! Every node in a game group keeps a copy of one append-only log of player
//! actions. A single leader orders the actions, streams them to the other
//! members over UDP and advances a commit index once a majority of live
//! members hold an entry. Every node then applies committed actions in the
//! same order, so all players see the same game history.
//!
//! # Architecture
//!
//! Each [`RaftNode`] runs a handful of tokio tasks that share its state
//! through an `Arc`:
//!
//! - **Receiver**: decrypts, decodes and dispatches every inbound datagram
//! - **Heartbeat scheduler** (leader): appends at most one queued action per
//!   tick and broadcasts it, or sends a heartbeat
//! - **Liveness checker** (leader): marks silent followers as timed out
//! - **Log confirmer** (leader): advances the commit index to the majority
//!   acknowledged index
//! - **Log maintainer** (follower): moves out-of-order entries into the log
//!   in index order, checking each against the term of the entry before it
//! - **Election checker** (follower): pings a quiet leader, then starts an
//!   election if it stays quiet
//! - **Applier**: hands committed entries to the [`StateMachine`]
//!
//! Followers acknowledge and commit only the part of their log verified
//! against the current leader's, so an entry a former leader appended but
//! never replicated is never applied.
//!
//! Shared state is lock-light: sessions live in a `DashMap`, the commit index
//! and membership states are atomics updated with compare-and-set, and tasks
//! park on `tokio::sync::Notify` instead of polling.
//!
//! # Security
//!
//! Everything but the two join handshake packets is sealed with AES-256-GCM
//! under a group secret. A joiner receives that secret from the leader,
//! wrapped with an X25519 key agreement.
//!
//! # Modules
//!
//! - [`node`]: the node, its client API and leader-side ticks
//! - `receiver`: inbound loop and packet handlers
//! - `election`: terms, votes and role changes
//! - [`confirmer`]: majority commit computation
//! - [`follower`]: in-order log maintenance on followers
//! - [`applier`]: the [`StateMachine`] seam
//! - [`session`]: per-peer session table
//! - [`log`]: the action log and commit index
//! - [`transport`] / [`crypto`] / [`packet`]: wire envelope, keys and packets
//! - [`protocol`]: console command parsing

pub mod action;
pub mod applier;
pub mod config;
pub mod confirmer;
pub mod crypto;
mod election;
pub mod follower;
pub mod history;
pub mod log;
pub mod node;
pub mod packet;
pub mod protocol;
mod receiver;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use action::{Action, AdminCommand, LogEntry};
pub use applier::StateMachine;
pub use config::{NodeConfig, TimerConfig};
pub use history::ActionHistory;
pub use node::{NodeStatus, RaftNode};
pub use session::{MembershipState, Session};

//! CLI entry point for running a game node with an interactive console.
//!
//! # Example usage
//!
//! Start a group and have two more players join it:
//! ```bash
//! # Terminal 1 (leader)
//! cargo run --bin node -- --username alice --port 7101
//!
//! # Terminal 2
//! cargo run --bin node -- --username bob --port 7102 --join 127.0.0.1:7101
//!
//! # Terminal 3
//! cargo run --bin node -- --username carol --port 7103 --join 127.0.0.1:7101
//! ```
//!
//! Committed actions are printed on every node as they are applied.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use game_raft::protocol::ConsoleCommand;
use game_raft::{
    ActionHistory, LogEntry, NodeConfig, NodeStatus, RaftNode, StateMachine, TimerConfig,
};

/// Command-line arguments for a game node.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run a replicated game node with an interactive console")]
struct Args {
    /// Player name; must be unique within the group
    #[arg(long)]
    username: String,

    /// UDP port to bind on all interfaces
    #[arg(long, conflicts_with = "listen", default_value_t = 0)]
    port: u16,

    /// Full address to bind, e.g. 127.0.0.1:7101 (overrides --port)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Address of the group leader to join; starts a new group when omitted
    #[arg(long)]
    join: Option<SocketAddr>,

    /// Address peers should use to reach this node. When bound to all
    /// interfaces and this is omitted, loopback is advertised, which only
    /// works for groups on one host.
    #[arg(long)]
    advertise: Option<SocketAddr>,

    /// Leader heartbeat period in milliseconds
    #[arg(long, default_value_t = 10)]
    heartbeat_ms: u64,

    /// How often the leader checks follower liveness, in milliseconds
    #[arg(long, default_value_t = 300)]
    liveness_check_ms: u64,

    /// Silence after which a follower is considered timed out, in milliseconds
    #[arg(long, default_value_t = 200)]
    liveness_threshold_ms: u64,

    /// How often a follower checks on its leader, in milliseconds
    #[arg(long, default_value_t = 50)]
    election_check_ms: u64,

    /// Leader silence before an election starts, in milliseconds
    #[arg(long, default_value_t = 300)]
    election_timeout_ms: u64,

    /// Random extra election delay upper bound, in milliseconds
    #[arg(long, default_value_t = 150)]
    election_jitter_ms: u64,

    /// Period between join attempts, in milliseconds
    #[arg(long, default_value_t = 250)]
    hello_retry_ms: u64,

    /// Maximum entries resent to a lagging follower per acknowledgment
    #[arg(long, default_value_t = 32)]
    catch_up_batch: usize,
}

impl Args {
    fn node_config(&self) -> NodeConfig {
        let listen = self
            .listen
            .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port));
        let timers = TimerConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            liveness_check_interval: Duration::from_millis(self.liveness_check_ms),
            liveness_threshold: Duration::from_millis(self.liveness_threshold_ms),
            election_check_interval: Duration::from_millis(self.election_check_ms),
            election_timeout: Duration::from_millis(self.election_timeout_ms),
            election_jitter: Duration::from_millis(self.election_jitter_ms),
            hello_retry_interval: Duration::from_millis(self.hello_retry_ms),
            catch_up_batch: self.catch_up_batch,
        };
        let config = NodeConfig::new(self.username.clone(), listen).with_timers(timers);
        match self.advertise {
            Some(advertise) => config.with_advertise(advertise),
            None => config,
        }
    }
}

/// Prints each applied action and keeps the history for LOG.
struct ConsoleMachine {
    history: ActionHistory,
}

impl StateMachine for ConsoleMachine {
    fn apply(&self, entry: &LogEntry) {
        match entry.action.as_admin() {
            Some(admin) => println!("[{}] * {}", entry.index, admin),
            None => println!(
                "[{}] {}: {}",
                entry.index, entry.action.username, entry.action.command
            ),
        }
        self.history.apply(entry);
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let machine = Arc::new(ConsoleMachine {
        history: ActionHistory::new(),
    });
    let node = RaftNode::bind(args.node_config(), machine.clone()).await?;

    let joined = match args.join {
        Some(group) => node.join_group(group).await,
        None => node.start_group(),
    };
    if let Err(err) = joined {
        node.exit_group().await;
        return Err(err).context("could not enter a group");
    }

    println!(
        "{} ready on {}. Type HELP (or h) for commands.",
        node.username(),
        node.local_addr()
    );
    let result = run_console(&node, &machine).await;
    node.exit_group().await;
    result
}

async fn run_console(node: &Arc<RaftNode>, machine: &ConsoleMachine) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received");
                return Ok(());
            }
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        match ConsoleCommand::parse(&line) {
            Ok(ConsoleCommand::Act { command }) => node.submit_action(command).await,
            Ok(ConsoleCommand::Log) => {
                for entry in machine.history.snapshot() {
                    println!(
                        "[{}] {}: {}",
                        entry.index, entry.action.username, entry.action.command
                    );
                }
            }
            Ok(ConsoleCommand::Status) => print_status(&node.status()),
            Ok(ConsoleCommand::Help) => print_help(),
            Ok(ConsoleCommand::Exit) => return Ok(()),
            Err(err) => warn!("{err}"),
        }
    }
}

fn print_status(status: &NodeStatus) {
    println!(
        "{} is {} in term {} (leader: {})",
        status.username,
        status.state,
        status.term,
        status.leader.as_deref().unwrap_or("unknown")
    );
    println!(
        "log: {} entries, committed through {}",
        status.log_len, status.commit_index
    );
    if let Some(index) = status.log_conflict {
        println!("log differs from the leader's at entry {index}; nothing past it will apply");
    }
    for session in &status.sessions {
        println!(
            "  {:<16} {:<22} {:<16} ack={:<6}{}",
            session.username,
            session.address,
            session.state.to_string(),
            session.greatest_acknowledged,
            if session.timed_out { " timed out" } else { "" }
        );
    }
}

fn print_help() {
    println!("Commands:");
    println!("  ACT/a <action>  submit a game action");
    println!("  LOG/l           print applied actions");
    println!("  STATUS/s        show role, leader, term and sessions");
    println!("  HELP/h          show this help");
    println!("  EXIT/e          leave the group");
}

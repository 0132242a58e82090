//! Node configuration and timer periods.

use std::net::SocketAddr;
use std::time::Duration;

/// Timer periods and thresholds driving the replication engine.
///
/// The defaults are tuned for a LAN game session: a 10ms heartbeat keeps
/// action latency low, and a follower is considered gone after 200ms of
/// silence.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Leader tick: dequeue at most one action and broadcast it (or a heartbeat).
    pub heartbeat_interval: Duration,
    /// How often the leader scans follower sessions for staleness.
    pub liveness_check_interval: Duration,
    /// Silence after which a follower session is marked timed out.
    pub liveness_threshold: Duration,
    /// How often a follower checks whether its leader has gone quiet.
    pub election_check_interval: Duration,
    /// Leader silence after which a follower starts an election.
    pub election_timeout: Duration,
    /// Upper bound of the random extra delay added to each election deadline.
    pub election_jitter: Duration,
    /// How often a joiner resends its hello until it is admitted.
    pub hello_retry_interval: Duration,
    /// Maximum entries retransmitted to a lagging follower per acknowledgment.
    pub catch_up_batch: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(10),
            liveness_check_interval: Duration::from_millis(300),
            liveness_threshold: Duration::from_millis(200),
            election_check_interval: Duration::from_millis(50),
            election_timeout: Duration::from_millis(300),
            election_jitter: Duration::from_millis(150),
            hello_retry_interval: Duration::from_millis(250),
            catch_up_batch: 32,
        }
    }
}

/// Configuration for binding a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Name this node's player acts under; also its session key on peers.
    pub username: String,
    /// UDP address to bind, e.g. `0.0.0.0:7101`.
    pub listen: SocketAddr,
    /// Address peers should use to reach this node, recorded in the log when
    /// this node starts a group. Defaults to the bound socket address, or to
    /// loopback on the bound port when bound to an unspecified address.
    pub advertise: Option<SocketAddr>,
    pub timers: TimerConfig,
}

impl NodeConfig {
    pub fn new(username: impl Into<String>, listen: SocketAddr) -> Self {
        Self {
            username: username.into(),
            listen,
            advertise: None,
            timers: TimerConfig::default(),
        }
    }

    pub fn with_timers(mut self, timers: TimerConfig) -> Self {
        self.timers = timers;
        self
    }

    pub fn with_advertise(mut self, advertise: SocketAddr) -> Self {
        self.advertise = Some(advertise);
        self
    }
}

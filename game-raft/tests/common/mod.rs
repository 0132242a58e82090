//! Test harness for groups of real nodes on loopback UDP sockets.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use game_raft::{ActionHistory, MembershipState, NodeConfig, RaftNode};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Polls `ready` until it holds or `timeout` passes.
pub async fn wait_for(what: &str, timeout: Duration, mut ready: impl FnMut() -> bool) -> Result<()> {
    let start = Instant::now();
    loop {
        if ready() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("timeout waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub struct Member {
    pub node: Arc<RaftNode>,
    pub history: Arc<ActionHistory>,
}

pub async fn bind(username: &str) -> Result<Member> {
    let history = Arc::new(ActionHistory::new());
    let config = NodeConfig::new(username, "127.0.0.1:0".parse()?);
    let node = RaftNode::bind(config, history.clone()).await?;
    Ok(Member { node, history })
}

/// A group whose first member started it and the rest joined one at a time.
pub struct TestCluster {
    pub members: Vec<Member>,
}

impl TestCluster {
    pub async fn start(usernames: &[&str]) -> Result<Self> {
        let first = bind(usernames[0]).await?;
        first.node.start_group()?;
        let mut cluster = Self {
            members: vec![first],
        };
        for username in &usernames[1..] {
            cluster.join(username).await?;
        }
        cluster.wait_for_membership(TIMEOUT).await?;
        Ok(cluster)
    }

    /// Binds a new node and joins it through the current leader.
    pub async fn join(&mut self, username: &str) -> Result<usize> {
        let Some(leader) = self.leader() else {
            bail!("no leader to join through");
        };
        let leader = Arc::clone(leader);

        let member = bind(username).await?;
        member.node.join_group(leader.local_addr()).await?;
        wait_for(&format!("{username} to be admitted"), TIMEOUT, || {
            leader
                .sessions()
                .get(username)
                .is_some_and(|s| s.state() == MembershipState::Follower)
        })
        .await?;

        self.members.push(member);
        Ok(self.members.len() - 1)
    }

    pub fn node(&self, i: usize) -> &Arc<RaftNode> {
        &self.members[i].node
    }

    pub fn history(&self, i: usize) -> &ActionHistory {
        &self.members[i].history
    }

    /// The only active node that believes it leads, if exactly one does.
    pub fn leader(&self) -> Option<&Arc<RaftNode>> {
        let mut leaders = self
            .members
            .iter()
            .map(|m| &m.node)
            .filter(|n| n.is_active() && n.state() == MembershipState::Leader);
        let leader = leaders.next()?;
        leaders.next().is_none().then_some(leader)
    }

    pub fn active(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.node.is_active())
    }

    /// Waits until every active node has applied one membership entry per
    /// member, so everyone knows everyone.
    pub async fn wait_for_membership(&self, timeout: Duration) -> Result<()> {
        let expected = self.members.len();
        wait_for("membership to replicate", timeout, || {
            self.active().all(|m| {
                let history = m.history.snapshot();
                history.iter().filter(|e| e.action.as_admin().is_some()).count() >= expected
            })
        })
        .await
    }

    /// Waits until every active node has applied at least `count` game actions.
    pub async fn wait_for_commands(&self, count: usize, timeout: Duration) -> Result<()> {
        wait_for(&format!("{count} applied actions"), timeout, || {
            self.active().all(|m| m.history.commands().len() >= count)
        })
        .await
    }

    /// Waits until every active node follows the same single leader.
    pub async fn wait_for_single_leader(&self, timeout: Duration) -> Result<Arc<RaftNode>> {
        wait_for("a single agreed leader", timeout, || {
            let Some(leader) = self.leader() else {
                return false;
            };
            self.active()
                .all(|m| m.node.leader().as_deref() == Some(leader.username()))
        })
        .await?;
        match self.leader() {
            Some(leader) => Ok(Arc::clone(leader)),
            None => bail!("leader changed while checking"),
        }
    }

    pub async fn shutdown(self) {
        for member in &self.members {
            member.node.exit_group().await;
        }
    }
}

//! Push-pull gossip membership with timeout-driven failure detection.
//!
//! Every round a node bumps its own heartbeat and exchanges its full member
//! table with a few random live peers; both sides keep the fresher entry per
//! member, ordered by `(generation, heartbeat)`. A member not refreshed for
//! `suspect_timeout` becomes Suspect, and Dead after `dead_timeout`. A
//! voluntary leave gossips a Left entry. Dead and Left entries stay as
//! tombstones for a while so stale gossip cannot resurrect them.

use crate::config::NodeConfig;
use crate::peer::PeerClient;
use crate::types::{
    ClusterEvent, ClusterEventKind, GossipDigest, GossipMessage, Node, NodeMetadata, NodeName,
    NodeState,
};
use async_trait::async_trait;
use dashmap::DashMap;
use griddle::{GriddleError, Result};
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

pub const EVENT_CAPACITY: usize = 1024;

/// Carries gossip messages between nodes.
#[async_trait]
pub trait GossipTransport: Send + Sync {
    /// Send `message` to the node listening at `addr` and return its reply.
    async fn exchange(&self, addr: &str, message: GossipMessage) -> Result<GossipMessage>;
}

/// Gossip over `POST /internal/gossip`.
#[derive(Default)]
pub struct HttpGossipTransport {
    clients: DashMap<String, Arc<PeerClient>>,
}

impl HttpGossipTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl GossipTransport for HttpGossipTransport {
    async fn exchange(&self, addr: &str, message: GossipMessage) -> Result<GossipMessage> {
        let client = self
            .clients
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(PeerClient::new(addr)))
            .clone();
        client.gossip(&message).await
    }
}

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub gossip_interval: Duration,
    pub suspect_timeout: Duration,
    pub dead_timeout: Duration,
    /// Peers contacted per round.
    pub fanout: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        MembershipConfig {
            gossip_interval: Duration::from_millis(500),
            suspect_timeout: Duration::from_secs(5),
            dead_timeout: Duration::from_secs(15),
            fanout: 3,
        }
    }
}

impl MembershipConfig {
    pub fn from_node_config(config: &NodeConfig) -> Self {
        MembershipConfig {
            gossip_interval: config.gossip_interval(),
            suspect_timeout: config.suspect_timeout(),
            dead_timeout: config.dead_timeout(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
struct Member {
    metadata: NodeMetadata,
    generation: i64,
    heartbeat: u64,
    state: NodeState,
    last_seen: Instant,
}

impl Member {
    fn version(&self) -> (i64, u64) {
        (self.generation, self.heartbeat)
    }
}

type Table = BTreeMap<NodeName, Member>;

pub struct Membership {
    local_name: NodeName,
    generation: i64,
    config: MembershipConfig,
    transport: Arc<dyn GossipTransport>,
    table: RwLock<Table>,
    seeds: RwLock<Vec<String>>,
    events: broadcast::Sender<ClusterEvent>,
    shutdown: watch::Sender<bool>,
}

impl Membership {
    pub fn new(
        local_name: impl Into<String>,
        metadata: NodeMetadata,
        config: MembershipConfig,
        transport: Arc<dyn GossipTransport>,
    ) -> Arc<Self> {
        let local_name = local_name.into();
        let generation = chrono::Utc::now().timestamp_millis();
        let mut table = Table::new();
        table.insert(
            local_name.clone(),
            Member {
                metadata,
                generation,
                heartbeat: 0,
                state: NodeState::Alive,
                last_seen: Instant::now(),
            },
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Membership {
            local_name,
            generation,
            config,
            transport,
            table: RwLock::new(table),
            seeds: RwLock::new(Vec::new()),
            events,
            shutdown,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn local_metadata(&self) -> NodeMetadata {
        self.read()
            .get(&self.local_name)
            .map(|m| m.metadata.clone())
            .unwrap_or_else(|| NodeMetadata {
                advertise_addr: String::new(),
                rpc_port: 0,
                http_port: 0,
                roles: Default::default(),
            })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Live members (Alive or Suspect), the local node included.
    pub fn members(&self) -> Vec<Node> {
        self.read()
            .iter()
            .filter(|(_, m)| m.state.is_live())
            .map(|(name, m)| Node {
                name: name.clone(),
                metadata: m.metadata.clone(),
                state: m.state,
            })
            .collect()
    }

    pub fn metadata(&self, name: &str) -> Result<NodeMetadata> {
        self.read()
            .get(name)
            .map(|m| m.metadata.clone())
            .ok_or_else(|| GriddleError::NodeNotFound(name.to_string()))
    }

    pub fn state(&self, name: &str) -> Result<NodeState> {
        self.read()
            .get(name)
            .map(|m| m.state)
            .ok_or_else(|| GriddleError::NodeNotFound(name.to_string()))
    }

    /// Replace the local metadata and gossip it.
    pub fn update_metadata(&self, metadata: NodeMetadata) {
        let event = {
            let mut table = self.write();
            if let Some(me) = table.get_mut(&self.local_name) {
                me.metadata = metadata;
                me.heartbeat += 1;
            }
            build_event(&table, ClusterEventKind::Update, &self.local_name)
        };
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    /// Emit the local Join and start the gossip loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let joined = build_event(&self.read(), ClusterEventKind::Join, &self.local_name);
        if let Some(event) = joined {
            let _ = self.events.send(event);
        }

        let weak = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.gossip_interval;
        info!("[GOSSIP] {} started (generation {})", self.local_name, self.generation);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let Some(this) = weak.upgrade() else { break };
                this.gossip_round().await;
            }
            debug!("[GOSSIP] loop stopped");
        })
    }

    /// Stop gossiping without telling anyone. Peers will eventually mark
    /// this node dead.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Contact `seeds` (`host:rpc_port`) and merge their views. Returns how
    /// many seeds answered. Seeds are remembered and retried by the gossip
    /// loop while no peer is known.
    pub async fn join(&self, seeds: &[String]) -> Result<usize> {
        let own = self.local_metadata().rpc_addr();
        let targets: Vec<String> = seeds.iter().filter(|s| **s != own).cloned().collect();
        *self.seeds.write().unwrap_or_else(PoisonError::into_inner) = targets.clone();
        if targets.is_empty() {
            return Ok(0);
        }

        let contacted = self.exchange_with(targets.clone()).await;
        if contacted == 0 {
            return Err(GriddleError::Rpc(format!(
                "could not reach any of {} seed(s): {}",
                targets.len(),
                targets.join(", ")
            )));
        }
        info!("[GOSSIP] {} joined via {} seed(s)", self.local_name, contacted);
        Ok(contacted)
    }

    /// Gossip a Left entry for the local node to every live peer, then stop.
    pub async fn leave(&self, timeout: Duration) -> Result<()> {
        {
            let mut table = self.write();
            if let Some(me) = table.get_mut(&self.local_name) {
                me.state = NodeState::Left;
                me.heartbeat += 1;
            }
        }
        let targets = self.peer_addrs();
        let notified = tokio::time::timeout(timeout, self.exchange_with(targets)).await;
        self.stop();

        let left = build_event(&self.read(), ClusterEventKind::Leave, &self.local_name);
        if let Some(event) = left {
            let _ = self.events.send(event);
        }

        match notified {
            Ok(_) => {
                info!("[GOSSIP] {} left the cluster", self.local_name);
                Ok(())
            }
            Err(_) => {
                warn!("[GOSSIP] leave notification timed out after {:?}", timeout);
                Err(GriddleError::Timeout("leave notification".into()))
            }
        }
    }

    /// Answer an incoming exchange: merge the sender's view, reply with ours.
    pub fn handle_gossip(&self, incoming: GossipMessage) -> GossipMessage {
        self.merge(incoming.members);
        self.message()
    }

    fn message(&self) -> GossipMessage {
        let table = self.read();
        let members = table
            .iter()
            .filter(|(_, m)| m.state != NodeState::Dead)
            .map(|(name, m)| GossipDigest {
                name: name.clone(),
                metadata: m.metadata.clone(),
                generation: m.generation,
                heartbeat: m.heartbeat,
                state: if m.state == NodeState::Left {
                    NodeState::Left
                } else {
                    NodeState::Alive
                },
            })
            .collect();
        GossipMessage {
            from: self.local_name.clone(),
            members,
        }
    }

    fn merge(&self, digests: Vec<GossipDigest>) {
        let now = Instant::now();
        let mut changes = Vec::new();
        let events: Vec<ClusterEvent> = {
            let mut table = self.write();
            for digest in digests {
                if digest.state == NodeState::Dead {
                    continue;
                }
                let leaving = digest.state == NodeState::Left;

                if digest.name == self.local_name {
                    // someone still believes an older incarnation of us left
                    if let Some(me) = table.get_mut(&self.local_name) {
                        if me.state == NodeState::Alive
                            && leaving
                            && digest.generation == self.generation
                            && digest.heartbeat >= me.heartbeat
                        {
                            me.heartbeat = digest.heartbeat + 1;
                        }
                    }
                    continue;
                }

                match table.get_mut(&digest.name) {
                    None => {
                        let state = if leaving { NodeState::Left } else { NodeState::Alive };
                        table.insert(
                            digest.name.clone(),
                            Member {
                                metadata: digest.metadata,
                                generation: digest.generation,
                                heartbeat: digest.heartbeat,
                                state,
                                last_seen: now,
                            },
                        );
                        if !leaving {
                            changes.push((ClusterEventKind::Join, digest.name));
                        }
                    }
                    Some(member) => {
                        if digest.version() <= member.version() {
                            continue;
                        }
                        let was = member.state;
                        let metadata_changed = member.metadata != digest.metadata;
                        member.metadata = digest.metadata;
                        member.generation = digest.generation;
                        member.heartbeat = digest.heartbeat;
                        member.last_seen = now;

                        let kind = if leaving {
                            member.state = NodeState::Left;
                            was.is_live().then_some(ClusterEventKind::Leave)
                        } else {
                            member.state = NodeState::Alive;
                            if !was.is_live() {
                                Some(ClusterEventKind::Join)
                            } else if metadata_changed || was == NodeState::Suspect {
                                Some(ClusterEventKind::Update)
                            } else {
                                None
                            }
                        };
                        if let Some(kind) = kind {
                            changes.push((kind, digest.name));
                        }
                    }
                }
            }
            changes
                .iter()
                .filter_map(|(kind, name)| build_event(&table, *kind, name))
                .collect()
        };
        for event in events {
            info!(
                "[GOSSIP] {:?} {} ({:?}), {} live member(s)",
                event.kind,
                event.node_name,
                event.state,
                event.members.len()
            );
            let _ = self.events.send(event);
        }
    }

    /// Advance Alive → Suspect → Dead by idle time and reap old tombstones.
    fn check_liveness(&self) {
        let now = Instant::now();
        let mut changes = Vec::new();
        let events: Vec<ClusterEvent> = {
            let mut table = self.write();
            let mut reaped = Vec::new();
            for (name, member) in table.iter_mut() {
                if *name == self.local_name {
                    continue;
                }
                let idle = now.saturating_duration_since(member.last_seen);
                match member.state {
                    NodeState::Alive if idle >= self.config.suspect_timeout => {
                        member.state = NodeState::Suspect;
                        changes.push((ClusterEventKind::Update, name.clone()));
                    }
                    NodeState::Suspect if idle >= self.config.dead_timeout => {
                        member.state = NodeState::Dead;
                        changes.push((ClusterEventKind::Leave, name.clone()));
                    }
                    NodeState::Dead | NodeState::Left if idle >= self.config.dead_timeout * 2 => {
                        reaped.push(name.clone());
                    }
                    _ => {}
                }
            }
            let events = changes
                .iter()
                .filter_map(|(kind, name)| build_event(&table, *kind, name))
                .collect();
            for name in reaped {
                debug!("[GOSSIP] reaped tombstone for {}", name);
                table.remove(&name);
            }
            events
        };
        for event in events {
            warn!(
                "[GOSSIP] {} is now {:?} ({} live member(s))",
                event.node_name,
                event.state,
                event.members.len()
            );
            let _ = self.events.send(event);
        }
    }

    fn peer_addrs(&self) -> Vec<String> {
        self.read()
            .iter()
            .filter(|(name, m)| **name != self.local_name && m.state.is_live())
            .map(|(_, m)| m.metadata.rpc_addr())
            .collect()
    }

    fn pick_targets(&self) -> Vec<String> {
        let mut peers = self.peer_addrs();
        if peers.is_empty() {
            return self.seeds.read().unwrap_or_else(PoisonError::into_inner).clone();
        }
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(self.config.fanout.max(1));
        peers
    }

    /// Exchange with every address concurrently; returns how many answered.
    async fn exchange_with(&self, targets: Vec<String>) -> usize {
        let message = self.message();
        let per_exchange = self.config.suspect_timeout;
        let mut set = JoinSet::new();
        for addr in targets {
            let transport = Arc::clone(&self.transport);
            let message = message.clone();
            set.spawn(async move {
                let reply = tokio::time::timeout(per_exchange, transport.exchange(&addr, message))
                    .await
                    .unwrap_or_else(|_| Err(GriddleError::Timeout(format!("gossip to {}", addr))));
                (addr, reply)
            });
        }

        let mut answered = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(reply))) => {
                    answered += 1;
                    self.merge(reply.members);
                }
                Ok((addr, Err(e))) => warn!("[GOSSIP] exchange with {} failed: {}", addr, e),
                Err(e) => warn!("[GOSSIP] exchange task failed: {}", e),
            }
        }
        answered
    }

    async fn gossip_round(&self) {
        if let Some(me) = self.write().get_mut(&self.local_name) {
            me.heartbeat += 1;
        }
        let targets = self.pick_targets();
        if !targets.is_empty() {
            self.exchange_with(targets).await;
        }
        self.check_liveness();
    }
}

fn build_event(table: &Table, kind: ClusterEventKind, name: &str) -> Option<ClusterEvent> {
    let member = table.get(name)?;
    Some(ClusterEvent {
        kind,
        node_name: name.to_string(),
        metadata: member.metadata.clone(),
        state: member.state,
        members: table
            .iter()
            .filter(|(_, m)| m.state.is_live())
            .map(|(n, _)| n.clone())
            .collect(),
    })
}

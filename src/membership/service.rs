use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use std::{net::SocketAddr, time::Duration};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::info;

use super::types::{Address, ClusterView, GossipMessage, Node, NodeState};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Gossip based membership that turns member health into a sequence of `ClusterView`s.
///
/// Every change of the non-dead member set publishes a new view on a watch channel. The
/// topology manager consumes that channel; nothing else in the cache reads gossip state.
pub struct MembershipService {
    pub local_node: Node,
    pub members: Arc<DashMap<Address, Node>>,
    socket: Arc<UdpSocket>,
    incarnation: AtomicU64,
    views: watch::Sender<Arc<ClusterView>>,
}

impl MembershipService {
    pub async fn new(
        address: Address,
        bind_addr: SocketAddr,
        http_addr: SocketAddr,
        seed_nodes: Vec<SocketAddr>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_node = Node {
            address,
            gossip_addr: socket.local_addr()?,
            http_addr,
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        };
        let members = Arc::new(DashMap::new());
        members.insert(local_node.address.clone(), local_node.clone());

        if !seed_nodes.is_empty() {
            info!("Joining cluster via {} seed node(s)", seed_nodes.len());

            let msg = GossipMessage::Join {
                node: local_node.clone(),
            };
            let encoded = bincode::serialize(&msg)?;
            for seed_node in seed_nodes.iter() {
                socket.send_to(&encoded, seed_node).await?;
                info!("Sent join request to {}", seed_node);
            }
        }

        let (views, _) = watch::channel(Arc::new(ClusterView::singleton(
            local_node.address.clone(),
        )));

        Ok(Arc::new(Self {
            local_node,
            members,
            socket: Arc::new(socket),
            incarnation: AtomicU64::new(1),
            views,
        }))
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting membership service...");

        {
            let service = self.clone();
            tokio::spawn(async move {
                service.gossip_loop().await;
            });
        }

        {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            });
        }

        {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop().await;
            });
        }

        tracing::info!("All membership tasks started");
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_member(&self, address: &Address) -> Option<Node> {
        self.members.get(address).map(|entry| entry.value().clone())
    }

    pub fn current_view(&self) -> Arc<ClusterView> {
        self.views.borrow().clone()
    }

    pub fn subscribe_views(&self) -> watch::Receiver<Arc<ClusterView>> {
        self.views.subscribe()
    }

    /// Publishes a new view if the set of non-dead members changed.
    ///
    /// The view id is the membership epoch when that moved forward, so nodes that have
    /// converged on the same gossip state also agree on the view id.
    pub(crate) fn refresh_view(&self) {
        let mut members: Vec<Address> = self
            .members
            .iter()
            .filter(|entry| entry.value().state != NodeState::Dead)
            .map(|entry| entry.key().clone())
            .collect();
        members.sort();
        let epoch = self.epoch();

        self.views.send_if_modified(|current| {
            if current.members == members {
                return false;
            }
            let view_id = epoch.max(current.view_id + 1);
            let next = ClusterView::new(view_id, members);
            tracing::info!(
                "Installing view {} with {} member(s): {:?}",
                next.view_id,
                next.size(),
                next.members
            );
            *current = Arc::new(next);
            true
        });
    }

    /// Grows with every incarnation bump and every death, and never shrinks.
    fn epoch(&self) -> u64 {
        self.members
            .iter()
            .map(|entry| {
                let member = entry.value();
                let incarnation = if member.address == self.local_node.address {
                    self.incarnation.load(Ordering::SeqCst)
                } else {
                    member.incarnation
                };
                incarnation * 2 + u64::from(member.state == NodeState::Dead)
            })
            .sum()
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let alive_members: Vec<Node> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.value().address != self.local_node.address
                        && entry.value().state == NodeState::Alive
                })
                .map(|entry| entry.value().clone())
                .collect();

            if alive_members.is_empty() {
                continue;
            }

            let target = {
                use rand::Rng;
                let idx = rand::thread_rng().gen_range(0..alive_members.len());
                &alive_members[idx]
            };

            let msg = GossipMessage::Ping {
                from: self.local_node.address.clone(),
                incarnation: self.incarnation.load(Ordering::SeqCst),
            };

            match bincode::serialize(&msg) {
                Ok(encoded) => {
                    if let Err(e) = self.socket.send_to(&encoded, target.gossip_addr).await {
                        tracing::warn!("Failed to send ping to {}: {}", target.address, e);
                    } else {
                        tracing::trace!("Sent ping to {}", target.address);
                    }
                }
                Err(e) => tracing::error!("Failed to serialize ping: {}", e),
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub(crate) async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping { from, incarnation } => {
                self.handle_ping(from, incarnation, src).await?;
            }
            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members);
            }
            GossipMessage::Join { node } => {
                self.handle_join(node);
            }
            GossipMessage::Suspect {
                address,
                incarnation,
            } => {
                self.handle_suspect(address, incarnation).await;
            }
            GossipMessage::Alive {
                address,
                incarnation,
            } => {
                self.handle_alive(address, incarnation);
            }
        }

        self.refresh_view();
        Ok(())
    }

    async fn handle_ping(
        &self,
        from: Address,
        from_incarnation: u64,
        src: SocketAddr,
    ) -> Result<()> {
        tracing::trace!("Received ping from {}", from);

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        } else {
            // A ping only tells us the gossip address; the Ack exchange fills in the rest.
            tracing::debug!("Ping from unknown member {} at {}", from, src);
        }

        let all_members: Vec<Node> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let reply = GossipMessage::Ack {
            from: self.local_node.address.clone(),
            incarnation: self.incarnation.load(Ordering::SeqCst),
            members: all_members,
        };

        let encoded = bincode::serialize(&reply)?;
        self.socket.send_to(&encoded, src).await?;

        Ok(())
    }

    fn handle_ack(&self, from: Address, from_incarnation: u64, members: Vec<Node>) {
        tracing::trace!(
            "Received ack from {} (inc={}) with {} members",
            from,
            from_incarnation,
            members.len()
        );

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        }

        for member in members {
            self.merge_member(member);
        }
    }

    fn merge_member(&self, new_member: Node) {
        if new_member.address == self.local_node.address {
            return;
        }

        match self.members.get_mut(&new_member.address) {
            Some(mut existing) => {
                if new_member.incarnation > existing.incarnation {
                    tracing::debug!(
                        "Updating {}: inc {} -> {}",
                        new_member.address,
                        existing.incarnation,
                        new_member.incarnation,
                    );
                    existing.state = new_member.state;
                    existing.incarnation = new_member.incarnation;
                    existing.last_seen = Some(Instant::now());
                } else if new_member.incarnation == existing.incarnation
                    && new_member.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!("{} refuted suspicion", new_member.address);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::info!(
                    "Discovered new member {} at {}",
                    new_member.address,
                    new_member.gossip_addr
                );
                let mut member = new_member;
                member.last_seen = Some(Instant::now());
                self.members.insert(member.address.clone(), member);
            }
        }
    }

    async fn handle_suspect(&self, address: Address, incarnation: u64) {
        if address == self.local_node.address {
            // Refute by bumping our incarnation above the accusation.
            let next = self
                .incarnation
                .fetch_max(incarnation + 1, Ordering::SeqCst)
                .max(incarnation + 1);
            tracing::info!("Refuting suspicion with incarnation {}", next);
            self.broadcast_message(GossipMessage::Alive {
                address,
                incarnation: next,
            })
            .await;
            return;
        }

        match self.members.get_mut(&address) {
            Some(mut existing) if incarnation >= existing.incarnation => {
                if existing.state == NodeState::Alive {
                    tracing::info!(
                        "Node {} at {} suspected",
                        existing.address,
                        existing.gossip_addr
                    );
                    existing.state = NodeState::Suspect;
                }
                existing.incarnation = incarnation;
            }
            Some(_) => {}
            None => {
                tracing::debug!("Suspected node {} doesn't exist", address);
            }
        }
    }

    fn handle_alive(&self, address: Address, incarnation: u64) {
        match self.members.get_mut(&address) {
            Some(mut existing) => {
                if incarnation > existing.incarnation
                    || (incarnation == existing.incarnation
                        && existing.state == NodeState::Suspect)
                {
                    tracing::info!("Node {} is alive (inc={})", existing.address, incarnation);
                    existing.state = NodeState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::debug!("Alive message for unknown node {}", address);
            }
        }
    }

    fn handle_join(&self, mut node: Node) {
        tracing::info!("Node {} joining cluster at {}", node.address, node.gossip_addr);

        node.state = NodeState::Alive;
        node.last_seen = Some(Instant::now());
        self.members.insert(node.address.clone(), node);

        tracing::info!("Cluster size now: {}", self.members.len());
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            let now = Instant::now();
            let mut messages_to_broadcast = Vec::new();

            for mut entry in self.members.iter_mut() {
                let member = entry.value_mut();
                if member.address == self.local_node.address {
                    continue;
                }

                let Some(last_seen) = member.last_seen else {
                    member.last_seen = Some(now);
                    continue;
                };
                let elapsed = now.duration_since(last_seen);

                match member.state {
                    NodeState::Alive if elapsed > SUSPECT_TIMEOUT => {
                        tracing::warn!(
                            "Node {} suspected (no contact for {:?})",
                            member.address,
                            elapsed
                        );
                        member.state = NodeState::Suspect;
                        messages_to_broadcast.push(GossipMessage::Suspect {
                            address: member.address.clone(),
                            incarnation: member.incarnation,
                        });
                    }
                    NodeState::Suspect if elapsed > DEAD_TIMEOUT => {
                        tracing::warn!(
                            "Node {} declared dead (no contact for {:?})",
                            member.address,
                            elapsed
                        );
                        member.state = NodeState::Dead;
                    }
                    _ => {}
                }
            }

            self.refresh_view();

            for msg in messages_to_broadcast {
                self.broadcast_message(msg).await;
            }
        }
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let encoded = match bincode::serialize(&msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to serialize gossip message: {}", e);
                return;
            }
        };

        let targets: Vec<Node> = self
            .members
            .iter()
            .filter(|entry| {
                entry.value().address != self.local_node.address
                    && entry.value().state == NodeState::Alive
            })
            .map(|entry| entry.value().clone())
            .collect();

        for member in targets {
            if let Err(e) = self.socket.send_to(&encoded, member.gossip_addr).await {
                tracing::warn!("Failed to broadcast to {}: {}", member.address, e);
            }
        }
    }
}

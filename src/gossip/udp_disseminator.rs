use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use rustc_hash::FxHashSet;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{watch, RwLock};
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::gossip::Disseminator;
use crate::messaging::envelope::{Message, HEADER_SIZE};
use crate::router_config::RouterConfig;
use crate::util::delivery_queue::DeliveryQueue;

/// Gossip over plain UDP datagrams. One socket serves both directions.
///
/// Explicit triggers (`multicast`) flood to every known peer immediately; on top of
///  that, a periodic task re-sends recently originated messages to a fanout-limited
///  random subset of peers, compensating for UDP's lack of delivery guarantees.
///  Datagram loss is silently tolerated, and a datagram that fails to deframe is
///  dropped without affecting the receive loop.
pub struct UdpDisseminator {
    socket: UdpSocket,
    peers: RwLock<FxHashSet<SocketAddr>>,
    delivered: DeliveryQueue<Message>,
    regossip_log: Mutex<VecDeque<Message>>,
    regossip_log_capacity: usize,
    fanout: usize,
    period: Duration,
    max_message_size: usize,
    shutdown: watch::Receiver<bool>,
}

impl UdpDisseminator {
    pub async fn bind(
        config: &RouterConfig,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Arc<UdpDisseminator>> {
        let socket = UdpSocket::bind(config.gossip_bind_addr).await?;
        info!("gossip endpoint listening on {}", socket.local_addr()?);

        Ok(Arc::new(UdpDisseminator {
            socket,
            peers: Default::default(),
            delivered: DeliveryQueue::new(),
            regossip_log: Mutex::new(VecDeque::new()),
            regossip_log_capacity: config.regossip_log_capacity,
            fanout: config.gossip_fanout,
            period: config.gossip_period,
            max_message_size: config.max_message_size,
            shutdown,
        }))
    }

    /// The actually bound address - relevant when binding to port 0.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receives datagrams, deframes them and pushes them to the delivery queue, for
    ///  the lifetime of the router. On shutdown it closes the delivery queue, which
    ///  in turn terminates the consumer loop.
    pub async fn run_receive_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut buf = vec![0u8; self.max_message_size + HEADER_SIZE];

        loop {
            select! {
                changed = shutdown.changed() => {
                    // a dropped sender counts as shutdown
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutting down gossip receive loop");
                        self.delivered.request_shutdown();
                        return;
                    }
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.on_datagram(&buf[..len], from),
                    Err(e) => {
                        warn!("error receiving gossip datagram: {}", e);
                    }
                }
            }
        }
    }

    fn on_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let mut buf = datagram;
        match Message::try_decode(&mut buf, self.max_message_size) {
            Ok(msg) => {
                trace!("delivering gossip message kind {} from {}", msg.kind, from);
                self.delivered.push(msg);
            }
            Err(e) => {
                warn!("dropping malformed gossip datagram from {}: {}", from, e);
            }
        }
    }

    /// Re-sends the not-yet-stabilized local messages to up to `fanout` peers every
    ///  `period`, selected randomly without replacement each round.
    pub async fn run_regossip_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut ticks = time::interval(self.period);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutting down re-gossip loop");
                        return;
                    }
                }
                _ = ticks.tick() => self.regossip_round().await,
            }
        }
    }

    async fn regossip_round(&self) {
        let messages = {
            let log = self.regossip_log.lock()
                .expect("re-gossip log lock poisoned");
            log.iter().cloned().collect::<Vec<_>>()
        };
        if messages.is_empty() {
            return;
        }

        let peers = self.peers.read().await.iter().copied().collect::<Vec<_>>();
        if peers.is_empty() {
            return;
        }

        let num_chosen = self.fanout.min(peers.len());
        let chosen = rand::seq::index::sample(&mut rand::thread_rng(), peers.len(), num_chosen);

        debug!("re-gossiping {} messages to {} of {} peers", messages.len(), num_chosen, peers.len());
        for peer_idx in chosen {
            for msg in &messages {
                self.send_to_peer(msg, peers[peer_idx]).await;
            }
        }
    }

    async fn send_to_peer(&self, msg: &Message, peer: SocketAddr) {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + msg.body.len());
        msg.encode(&mut buf);
        if let Err(e) = self.socket.send_to(&buf, peer).await {
            warn!("failed to send gossip datagram to {}: {}", peer, e);
        }
    }

    fn remember_for_regossip(&self, msg: &Message) {
        let mut log = self.regossip_log.lock()
            .expect("re-gossip log lock poisoned");
        log.push_back(msg.clone());
        while log.len() > self.regossip_log_capacity {
            log.pop_front();
        }
    }
}

#[async_trait]
impl Disseminator for UdpDisseminator {
    async fn multicast(&self, msg: &Message) {
        let peers = self.peers.read().await.iter().copied().collect::<Vec<_>>();
        trace!("multicasting message kind {} to {} peers", msg.kind, peers.len());
        for peer in peers {
            self.send_to_peer(msg, peer).await;
        }
        self.remember_for_regossip(msg);
    }

    async fn add_peer(&self, peer: SocketAddr) {
        if self.peers.write().await.insert(peer) {
            info!("peer {} joined the dissemination group", peer);
        }
    }

    async fn remove_peer(&self, peer: SocketAddr) {
        if self.peers.write().await.remove(&peer) {
            info!("peer {} left the dissemination group", peer);
        }
    }

    async fn next_delivered(&self) -> Option<Message> {
        self.delivered.pop().await
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    use bytes::{BufMut, Bytes};
    use tokio::time::timeout;

    use crate::messaging::envelope::ReplicationKind;

    use super::*;

    fn test_config() -> RouterConfig {
        let mut config = RouterConfig::new(
            PathBuf::from("/tmp/unused.sock"),
            "127.0.0.1:0".parse().unwrap(),
            Ipv4Addr::LOCALHOST,
        );
        config.gossip_period = Duration::from_millis(50);
        config
    }

    async fn bound_pair() -> (Arc<UdpDisseminator>, Arc<UdpDisseminator>, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let a = UdpDisseminator::bind(&test_config(), shutdown_rx.clone()).await.unwrap();
        let b = UdpDisseminator::bind(&test_config(), shutdown_rx).await.unwrap();
        (a, b, shutdown_tx)
    }

    #[tokio::test]
    async fn test_multicast_reaches_every_peer() {
        let (a, b, _shutdown) = bound_pair().await;
        let (_shutdown_tx_c, shutdown_rx_c) = watch::channel(false);
        let c = UdpDisseminator::bind(&test_config(), shutdown_rx_c).await.unwrap();

        tokio::spawn(b.clone().run_receive_loop());
        tokio::spawn(c.clone().run_receive_loop());

        a.add_peer(b.local_addr().unwrap()).await;
        a.add_peer(c.local_addr().unwrap()).await;

        let msg = Message::new(ReplicationKind::NewMapping, Bytes::from_static(b"payload"));
        a.multicast(&msg).await;

        let on_b = timeout(Duration::from_secs(2), b.next_delivered()).await.unwrap();
        let on_c = timeout(Duration::from_secs(2), c.next_delivered()).await.unwrap();
        assert_eq!(on_b, Some(msg.clone()));
        assert_eq!(on_c, Some(msg));
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped_and_loop_continues() {
        let (a, b, _shutdown) = bound_pair().await;
        tokio::spawn(b.clone().run_receive_loop());
        a.add_peer(b.local_addr().unwrap()).await;

        // a header declaring more body than the datagram carries
        let mut malformed = BytesMut::new();
        malformed.put_i32_ne(0);
        malformed.put_u32_ne(1000);
        malformed.put_u8(42);
        a.socket.send_to(&malformed, b.local_addr().unwrap()).await.unwrap();

        let valid = Message::new(ReplicationKind::DeleteMapping, Bytes::from_static(b"ok"));
        a.multicast(&valid).await;

        // the next valid datagram must still be delivered
        let delivered = timeout(Duration::from_secs(2), b.next_delivered()).await.unwrap();
        assert_eq!(delivered, Some(valid));
    }

    #[tokio::test]
    async fn test_regossip_reaches_a_late_joining_peer() {
        let (a, b, _shutdown) = bound_pair().await;
        tokio::spawn(a.clone().run_regossip_loop());
        tokio::spawn(b.clone().run_receive_loop());

        // originate while the group is still empty - flooding reaches nobody
        let msg = Message::new(ReplicationKind::NewMapping, Bytes::from_static(b"late"));
        a.multicast(&msg).await;

        a.add_peer(b.local_addr().unwrap()).await;

        // anti-entropy: a later re-gossip round must deliver the message
        let delivered = timeout(Duration::from_secs(2), b.next_delivered()).await.unwrap();
        assert_eq!(delivered, Some(msg));
    }

    #[tokio::test]
    async fn test_shutdown_terminates_delivery() {
        let (_a, b, shutdown) = bound_pair().await;
        let receive_loop = tokio::spawn(b.clone().run_receive_loop());

        shutdown.send(true).unwrap();
        timeout(Duration::from_secs(2), receive_loop).await
            .expect("receive loop did not stop")
            .unwrap();
        assert_eq!(b.next_delivered().await, None);
    }

    #[tokio::test]
    async fn test_membership_is_idempotent() {
        let (a, b, _shutdown) = bound_pair().await;
        let peer = b.local_addr().unwrap();

        a.add_peer(peer).await;
        a.add_peer(peer).await;
        assert_eq!(a.peers.read().await.len(), 1);

        a.remove_peer(peer).await;
        a.remove_peer(peer).await;
        assert!(a.peers.read().await.is_empty());
    }
}

//! Glue between an external orchestrator's membership notifications and the
//!  dissemination group. The orchestrator integration itself lives outside this
//!  crate; it only needs something to call when a router joins or leaves.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use crate::gossip::Disseminator;

pub struct MembershipHandler {
    disseminator: Arc<dyn Disseminator>,
}

impl MembershipHandler {
    pub fn new(disseminator: Arc<dyn Disseminator>) -> MembershipHandler {
        MembershipHandler { disseminator }
    }

    pub async fn on_join(&self, gossip_addr: SocketAddr) {
        info!("router at {} joined", gossip_addr);
        self.disseminator.add_peer(gossip_addr).await;
    }

    pub async fn on_leave(&self, gossip_addr: SocketAddr) {
        info!("router at {} left", gossip_addr);
        self.disseminator.remove_peer(gossip_addr).await;
    }
}

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::gossip::Disseminator;
use crate::messaging::envelope::{Message, ReplicationKind};
use crate::messaging::wire::AddressMapping;

/// Outcome of a removal. Removing a mapping that is not present is not a protocol
///  violation - gossip messages can arrive duplicated or out of order.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
}

/// The replicated, queryable address table: overlay 2-tuple to host 2-tuple.
///
/// The table is mutated only through this API, either from a request-handling task
///  (local bind/unbind) or from the single replication-consumer task (remote update);
///  a mutex serializes both with lookups.
///
/// Loop prevention invariant: a mapping received from the network is never
///  re-gossiped - remote-origin changes are applied with `should_multicast = false`.
pub struct MappingManager {
    mappings: Mutex<FxHashMap<u64, AddressMapping>>,
    disseminator: Arc<dyn Disseminator>,
}

impl MappingManager {
    pub fn new(disseminator: Arc<dyn Disseminator>) -> MappingManager {
        MappingManager {
            mappings: Mutex::new(FxHashMap::default()),
            disseminator,
        }
    }

    /// Inserts or overwrites by key: the table never holds two entries for the same
    ///  overlay 2-tuple, the most recently added value wins.
    pub async fn add_mapping(&self, mapping: AddressMapping, should_multicast: bool) {
        {
            let mut mappings = self.mappings.lock()
                .expect("mapping table lock poisoned");
            if let Some(prev) = mappings.insert(mapping.key(), mapping) {
                debug!("replacing mapping {:?} with {:?}", prev, mapping);
            } else {
                trace!("adding mapping {:?}", mapping);
            }
        }

        if should_multicast {
            self.multicast_change(ReplicationKind::NewMapping, &mapping).await;
        }
    }

    pub async fn remove_mapping(&self, mapping: AddressMapping, should_multicast: bool) -> RemoveOutcome {
        let removed = self.mappings.lock()
            .expect("mapping table lock poisoned")
            .remove(&mapping.key())
            .is_some();
        if !removed {
            debug!("removal of unknown mapping {:?} - ignoring", mapping);
            return RemoveOutcome::NotFound;
        }

        if should_multicast {
            self.multicast_change(ReplicationKind::DeleteMapping, &mapping).await;
        }
        RemoveOutcome::Removed
    }

    /// Point lookup by overlay 2-tuple. `None` means "not found", a recoverable
    ///  condition for callers (connect handling turns it into a refused connection).
    pub fn perform_lookup(&self, virtual_ip: Ipv4Addr, virtual_port: u16) -> Option<(Ipv4Addr, u16)> {
        let key = AddressMapping {
            virtual_ip,
            host_ip: Ipv4Addr::UNSPECIFIED,
            virtual_port,
            host_port: 0,
        }
        .key();

        self.mappings.lock()
            .expect("mapping table lock poisoned")
            .get(&key)
            .map(|m| (m.host_ip, m.host_port))
    }

    pub fn num_mappings(&self) -> usize {
        self.mappings.lock()
            .expect("mapping table lock poisoned")
            .len()
    }

    async fn multicast_change(&self, kind: ReplicationKind, mapping: &AddressMapping) {
        let mut body = BytesMut::with_capacity(AddressMapping::SERIALIZED_SIZE);
        mapping.ser(&mut body);
        self.disseminator.multicast(&Message::new(kind, body.freeze())).await;
    }

    /// Consumes messages delivered by the dissemination layer for the lifetime of the
    ///  router; terminates when the disseminator shuts down.
    pub async fn run_replication_loop(&self) {
        while let Some(msg) = self.disseminator.next_delivered().await {
            if let Err(e) = self.apply_replicated(msg).await {
                warn!("ignoring invalid replication message: {}", e);
            }
        }
        info!("shutting down mapping replication loop");
    }

    async fn apply_replicated(&self, msg: Message) -> anyhow::Result<()> {
        let kind = ReplicationKind::try_from(msg.kind)
            .map_err(|_| anyhow::anyhow!("unknown replication kind {}", msg.kind))?;
        let mut body = msg.body;
        let mapping = AddressMapping::try_deser(&mut body)?;

        // never re-multicast what arrived from the network
        match kind {
            ReplicationKind::NewMapping => {
                self.add_mapping(mapping, false).await;
            }
            ReplicationKind::DeleteMapping => {
                let _ = self.remove_mapping(mapping, false).await;
            }
        }
        Ok(())
    }
}

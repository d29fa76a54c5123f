use std::net::SocketAddr;

#[cfg(test)] use mockall::automock;

use crate::messaging::envelope::Message;

pub mod udp_disseminator;

/// Capability interface of the dissemination layer: best-effort fan-out of messages
///  to a peer group plus delivery of inbound messages. Implementations are selected
///  at construction time; consumers never depend on a concrete transport.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Disseminator: Send + Sync + 'static {
    /// Sends `msg` to every current member of the group. Per-peer send failures are
    ///  independent and non-fatal: a failure to reach one peer does not roll back
    ///  delivery to others. There is no acknowledgment or retransmission.
    async fn multicast(&self, msg: &Message);

    /// Idempotent. A send may race a concurrent membership change (best-effort).
    async fn add_peer(&self, peer: SocketAddr);

    /// Idempotent.
    async fn remove_peer(&self, peer: SocketAddr);

    /// Blocks until the next inbound message is delivered; `None` once the
    ///  disseminator has shut down. This is the only path by which inbound gossip
    ///  becomes visible to consumers.
    async fn next_delivered(&self) -> Option<Message>;
}

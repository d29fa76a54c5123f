use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// All tunables of a router process in one place. Construction provides defaults for
///  everything except the identity-defining parameters (control socket path, gossip
///  bind address, advertised host IP); callers override individual fields as needed.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// filesystem path of the unix domain socket that client shims connect to
    pub control_socket_path: PathBuf,
    /// local address the gossip UDP socket binds to
    pub gossip_bind_addr: SocketAddr,
    /// the host-namespace IP that locally created mappings advertise to peers
    pub host_ip: Ipv4Addr,

    /// number of peers contacted per periodic re-gossip round
    pub gossip_fanout: usize,
    /// wall-clock interval between re-gossip rounds
    pub gossip_period: Duration,
    /// how many locally originated messages are kept for re-gossip
    pub regossip_log_capacity: usize,

    /// upper bound on a message body; a header declaring more is a protocol violation
    pub max_message_size: usize,
}

impl RouterConfig {
    pub fn new(control_socket_path: PathBuf, gossip_bind_addr: SocketAddr, host_ip: Ipv4Addr) -> RouterConfig {
        RouterConfig {
            control_socket_path,
            gossip_bind_addr,
            host_ip,
            gossip_fanout: 2,
            gossip_period: Duration::from_secs(1),
            regossip_log_capacity: 64,
            max_message_size: 64 * 1024,
        }
    }
}

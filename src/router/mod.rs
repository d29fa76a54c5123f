//! The per-host router: accepts control connections from clients on a unix domain
//!  socket and performs host socket operations on their behalf.
//!
//! Request flow per connection: the client sends an envelope, then (for bind, accept
//!  and connect) exactly one descriptor-carrying ancillary message. The router
//!  answers socket and accept requests with an ancillary message followed by a
//!  status envelope, and bind and connect requests with a status envelope alone. The
//!  ancillary message is sent also on failure (without a descriptor), so the
//!  client's read sequence never depends on the outcome.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use nix::errno::Errno;
use tokio::net::{UnixListener, UnixStream};
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::mapping::MappingManager;
use crate::messaging::envelope::{Message, RequestKind};
use crate::messaging::fd_passing::{recv_fd, send_fd};
use crate::messaging::wire::{
    AcceptRequest, AddressMapping, BindRequest, ConnectRequest, SocketRequest, StatusResponse,
};
use crate::router::host_ops::HostSockets;
use crate::router_config::RouterConfig;

pub mod host_ops;

pub struct RouterServer {
    config: Arc<RouterConfig>,
    mapping_manager: Arc<MappingManager>,
    host_sockets: Arc<dyn HostSockets>,
    shutdown: watch::Receiver<bool>,
}

impl RouterServer {
    pub fn new(
        config: Arc<RouterConfig>,
        mapping_manager: Arc<MappingManager>,
        host_sockets: Arc<dyn HostSockets>,
        shutdown: watch::Receiver<bool>,
    ) -> RouterServer {
        RouterServer {
            config,
            mapping_manager,
            host_sockets,
            shutdown,
        }
    }

    /// Accepts control connections until shutdown, spawning one handler task per
    ///  connection. A failure to bind the control socket aborts startup; everything
    ///  after that point is handled per connection.
    pub async fn run(&self) -> anyhow::Result<()> {
        let path = &self.config.control_socket_path;
        match std::fs::remove_file(path) {
            Ok(()) => debug!("removed stale control socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).context(format!("removing stale control socket {}", path.display()))
            }
        }
        let listener = UnixListener::bind(path)
            .context(format!("binding control socket {}", path.display()))?;
        info!("control channel listening on {}", path.display());

        let mut shutdown = self.shutdown.clone();
        let mut handlers = JoinSet::new();
        loop {
            select! {
                changed = shutdown.changed() => {
                    // a dropped sender counts as shutdown
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutting down control channel");
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handler = ConnectionHandler {
                            stream,
                            mapping_manager: self.mapping_manager.clone(),
                            host_sockets: self.host_sockets.clone(),
                            config: self.config.clone(),
                        };
                        handlers.spawn(async move {
                            if let Err(e) = handler.run().await {
                                debug!("control connection closed with error: {:#}", e);
                            }
                        });
                    }
                    Err(e) => warn!("error accepting control connection: {}", e),
                },
                Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = finished {
                        warn!("connection handler task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        let _ = std::fs::remove_file(path);
        handlers.shutdown().await;
        Ok(())
    }
}

/// One task per client connection. Requests on a connection are handled strictly in
///  order; concurrency happens across connections.
struct ConnectionHandler {
    stream: UnixStream,
    mapping_manager: Arc<MappingManager>,
    host_sockets: Arc<dyn HostSockets>,
    config: Arc<RouterConfig>,
}

impl ConnectionHandler {
    async fn run(mut self) -> anyhow::Result<()> {
        loop {
            let msg = match Message::read_from(&mut self.stream, self.config.max_message_size).await? {
                Some(msg) => msg,
                None => {
                    debug!("client disconnected from the control channel");
                    return Ok(());
                }
            };

            let kind = match RequestKind::try_from(msg.kind) {
                Ok(kind) => kind,
                Err(_) => {
                    warn!("ignoring request of unknown kind {}", msg.kind);
                    continue;
                }
            };

            match kind {
                RequestKind::Socket => self.handle_socket(msg).await?,
                RequestKind::Bind => self.handle_bind(msg).await?,
                RequestKind::Accept => self.handle_accept(msg).await?,
                RequestKind::Connect => self.handle_connect(msg).await?,
            }
        }
    }

    async fn handle_socket(&mut self, msg: Message) -> anyhow::Result<()> {
        let request = match SocketRequest::try_deser(&mut msg.body.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed socket request: {}", e);
                send_fd(&self.stream, None).await?;
                return self.respond(RequestKind::Socket, -(Errno::EINVAL as i32)).await;
            }
        };

        match self.host_sockets.create_socket(request.domain, request.sock_type, request.protocol) {
            Ok(fd) => {
                debug!("created host socket for {:?}", request);
                send_fd(&self.stream, Some(fd.as_fd())).await?;
                self.respond(RequestKind::Socket, 0).await
                // fd drops here; the client holds the only remaining reference
            }
            Err(errno) => {
                warn!("socket creation failed for {:?}: {}", request, errno);
                send_fd(&self.stream, None).await?;
                self.respond(RequestKind::Socket, -(errno as i32)).await
            }
        }
    }

    async fn handle_bind(&mut self, msg: Message) -> anyhow::Result<()> {
        let fd = match recv_fd(&self.stream).await? {
            Some(fd) => fd,
            None => {
                warn!("bind request without a descriptor");
                return self.respond(RequestKind::Bind, -(Errno::EBADF as i32)).await;
            }
        };
        let request = match BindRequest::try_deser(&mut msg.body.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed bind request: {}", e);
                return self.respond(RequestKind::Bind, -(Errno::EINVAL as i32)).await;
            }
        };

        let status = self.bind_and_register(fd, request).await;
        self.respond(RequestKind::Bind, status).await
    }

    /// Binds the socket to an ephemeral host port and, on success, registers and
    ///  gossips the overlay-to-host mapping. A failed bind leaves the mapping table
    ///  untouched.
    async fn bind_and_register(&self, fd: OwnedFd, request: BindRequest) -> i32 {
        if let Err(errno) = self.host_sockets.bind_ephemeral(fd.as_raw_fd(), self.config.host_ip) {
            warn!("host bind failed for {:?}: {}", request, errno);
            return -(errno as i32);
        }
        let host_port = match self.host_sockets.bound_port(fd.as_raw_fd()) {
            Ok(port) => port,
            Err(errno) => {
                warn!("querying the bound port failed for {:?}: {}", request, errno);
                return -(errno as i32);
            }
        };

        let mapping = AddressMapping {
            virtual_ip: request.virtual_ip,
            host_ip: self.config.host_ip,
            virtual_port: request.virtual_port,
            host_port,
        };
        info!("registering mapping {}:{} -> {}:{}",
            mapping.virtual_ip, mapping.virtual_port, mapping.host_ip, mapping.host_port);
        self.mapping_manager.add_mapping(mapping, true).await;
        0
    }

    async fn handle_accept(&mut self, msg: Message) -> anyhow::Result<()> {
        let fd = match recv_fd(&self.stream).await? {
            Some(fd) => fd,
            None => {
                warn!("accept request without a descriptor");
                send_fd(&self.stream, None).await?;
                return self.respond(RequestKind::Accept, -(Errno::EBADF as i32)).await;
            }
        };
        let request = match AcceptRequest::try_deser(&mut msg.body.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed accept request: {}", e);
                send_fd(&self.stream, None).await?;
                return self.respond(RequestKind::Accept, -(Errno::EINVAL as i32)).await;
            }
        };

        // accept blocks indefinitely, so it must leave the async executor
        let host_sockets = self.host_sockets.clone();
        let accepted = tokio::task::spawn_blocking(move || {
            host_sockets.accept_blocking(fd.as_raw_fd(), request.flags)
        })
        .await?;

        match accepted {
            Ok(conn_fd) => {
                debug!("accepted a connection on behalf of a client");
                send_fd(&self.stream, Some(conn_fd.as_fd())).await?;
                self.respond(RequestKind::Accept, 0).await
            }
            Err(errno) => {
                warn!("host accept failed: {}", errno);
                send_fd(&self.stream, None).await?;
                self.respond(RequestKind::Accept, -(errno as i32)).await
            }
        }
    }

    async fn handle_connect(&mut self, msg: Message) -> anyhow::Result<()> {
        let fd = match recv_fd(&self.stream).await? {
            Some(fd) => fd,
            None => {
                warn!("connect request without a descriptor");
                return self.respond(RequestKind::Connect, -(Errno::EBADF as i32)).await;
            }
        };
        let request = match ConnectRequest::try_deser(&mut msg.body.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed connect request: {}", e);
                return self.respond(RequestKind::Connect, -(Errno::EINVAL as i32)).await;
            }
        };

        let (host_ip, host_port) = match self
            .mapping_manager
            .perform_lookup(request.virtual_ip, request.virtual_port)
        {
            Some(target) => target,
            None => {
                // nothing is bound to that overlay address anywhere in the group
                debug!("no mapping for {}:{}", request.virtual_ip, request.virtual_port);
                return self.respond(RequestKind::Connect, -(Errno::ECONNREFUSED as i32)).await;
            }
        };

        debug!("connecting {}:{} via {}:{}", request.virtual_ip, request.virtual_port, host_ip, host_port);
        let host_sockets = self.host_sockets.clone();
        let connected = tokio::task::spawn_blocking(move || {
            host_sockets.connect(fd.as_raw_fd(), host_ip, host_port)
        })
        .await?;

        let status = match connected {
            Ok(()) => 0,
            Err(errno) => {
                warn!("host connect to {}:{} failed: {}", host_ip, host_port, errno);
                -(errno as i32)
            }
        };
        self.respond(RequestKind::Connect, status).await
    }

    async fn respond(&mut self, kind: RequestKind, status: i32) -> anyhow::Result<()> {
        let mut body = BytesMut::with_capacity(StatusResponse::SERIALIZED_SIZE);
        StatusResponse { status }.ser(&mut body);
        Message::new(kind, body.freeze()).write_to(&mut self.stream).await
    }
}

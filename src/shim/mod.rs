//! The client side of the control protocol, for linking into namespaced processes.
//!
//! The shim decides per socket whether an address belongs to the overlay (see
//!  [overlay_prefix::OverlayPrefix]) and, for overlay sockets, asks the router to
//!  perform the operation on a host socket. Descriptors handed back by the router
//!  are adopted under the application's stable descriptor number (see
//!  [socket_duality::SocketDuality]).

use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::Path;

use anyhow::bail;
use bytes::BytesMut;
use nix::errno::Errno;
use nix::libc;
use std::net::Ipv4Addr;
use tokio::net::UnixStream;
use tracing::debug;

use crate::messaging::envelope::{Message, RequestKind};
use crate::messaging::fd_passing::{recv_fd, send_fd};
use crate::messaging::wire::{AcceptRequest, BindRequest, ConnectRequest, SocketRequest, StatusResponse};

pub mod overlay_prefix;
pub mod socket_duality;

/// Outcome of an operation the router performed on the client's behalf: `Err` is the
///  errno of the failed host syscall, to be raised as if it were the client's own.
pub type RemoteResult<T> = Result<T, Errno>;

/// Only TCP stream sockets participate in the overlay; everything else is left to
///  the regular socket API. AF_INET6 sockets qualify because they can carry
///  IPv4-mapped addresses - the per-address decision happens against the overlay
///  prefix at bind/connect time. Type flag bits like `SOCK_NONBLOCK` do not affect
///  the decision.
pub fn is_virtualized_socket(domain: i32, sock_type: i32, protocol: i32) -> bool {
    let base_type = sock_type & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC);
    (domain == libc::AF_INET || domain == libc::AF_INET6)
        && base_type == libc::SOCK_STREAM
        && (protocol == 0 || protocol == libc::IPPROTO_TCP)
}

/// One control connection to the local router. Requests are strictly sequential per
///  client; applications wanting concurrency open several clients.
pub struct RouterClient {
    stream: UnixStream,
    max_message_size: usize,
}

impl RouterClient {
    pub async fn connect(path: impl AsRef<Path>, max_message_size: usize) -> anyhow::Result<RouterClient> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        debug!("connected to the router at {}", path.as_ref().display());
        Ok(RouterClient {
            stream,
            max_message_size,
        })
    }

    pub fn from_stream(stream: UnixStream, max_message_size: usize) -> RouterClient {
        RouterClient {
            stream,
            max_message_size,
        }
    }

    /// Asks the router to create a host socket with the given arguments.
    pub async fn virtual_socket(&mut self, domain: i32, sock_type: i32, protocol: i32) -> anyhow::Result<RemoteResult<OwnedFd>> {
        let request = SocketRequest {
            domain,
            sock_type,
            protocol,
        };
        let mut body = BytesMut::new();
        request.ser(&mut body);
        Message::new(RequestKind::Socket, body.freeze()).write_to(&mut self.stream).await?;

        self.read_fd_and_status(RequestKind::Socket).await
    }

    /// Asks the router to bind the host socket `fd` for the overlay address. The
    ///  router chooses the host port and publishes the resulting mapping.
    pub async fn virtual_bind(&mut self, fd: BorrowedFd<'_>, virtual_ip: Ipv4Addr, virtual_port: u16) -> anyhow::Result<RemoteResult<()>> {
        let request = BindRequest {
            virtual_ip,
            virtual_port,
        };
        let mut body = BytesMut::new();
        request.ser(&mut body);
        Message::new(RequestKind::Bind, body.freeze()).write_to(&mut self.stream).await?;
        send_fd(&self.stream, Some(fd)).await?;

        self.read_status(RequestKind::Bind).await
    }

    /// Asks the router to block in accept on the listening host socket `fd` and
    ///  returns the accepted connection's descriptor.
    pub async fn virtual_accept(&mut self, fd: BorrowedFd<'_>, flags: i32) -> anyhow::Result<RemoteResult<OwnedFd>> {
        let request = AcceptRequest { flags };
        let mut body = BytesMut::new();
        request.ser(&mut body);
        Message::new(RequestKind::Accept, body.freeze()).write_to(&mut self.stream).await?;
        send_fd(&self.stream, Some(fd)).await?;

        self.read_fd_and_status(RequestKind::Accept).await
    }

    /// Asks the router to resolve the overlay address and connect the host socket
    ///  `fd` to its current host location.
    pub async fn virtual_connect(&mut self, fd: BorrowedFd<'_>, virtual_ip: Ipv4Addr, virtual_port: u16) -> anyhow::Result<RemoteResult<()>> {
        let request = ConnectRequest {
            virtual_ip,
            virtual_port,
        };
        let mut body = BytesMut::new();
        request.ser(&mut body);
        Message::new(RequestKind::Connect, body.freeze()).write_to(&mut self.stream).await?;
        send_fd(&self.stream, Some(fd)).await?;

        self.read_status(RequestKind::Connect).await
    }

    /// Responses that carry a descriptor: the ancillary message always precedes the
    ///  status envelope, with the descriptor present exactly on success.
    async fn read_fd_and_status(&mut self, kind: RequestKind) -> anyhow::Result<RemoteResult<OwnedFd>> {
        let fd = recv_fd(&self.stream).await?;
        let status = self.read_status(kind).await?;

        match (status, fd) {
            (Ok(()), Some(fd)) => Ok(Ok(fd)),
            (Err(errno), None) => Ok(Err(errno)),
            (Ok(()), None) => bail!("router reported success but sent no descriptor"),
            (Err(errno), Some(_)) => bail!("router sent a descriptor along with error {}", errno),
        }
    }

    async fn read_status(&mut self, kind: RequestKind) -> anyhow::Result<RemoteResult<()>> {
        let Some(msg) = Message::read_from(&mut self.stream, self.max_message_size).await? else {
            bail!("router closed the control connection mid-request");
        };
        if msg.kind != i32::from(kind) {
            bail!("response kind {} does not match request kind {:?}", msg.kind, kind);
        }

        let response = StatusResponse::try_deser(&mut msg.body.clone())?;
        if response.status == 0 {
            Ok(Ok(()))
        }
        else {
            Ok(Err(Errno::from_raw(-response.status)))
        }
    }
}

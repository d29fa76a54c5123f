//! The syscall seam of the router: every host socket operation performed on behalf
//!  of a client goes through [HostSockets], so request handling can be tested
//!  against a mock without touching real sockets.

use std::net::Ipv4Addr;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

#[cfg(test)] use mockall::automock;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::sys::socket::{accept4, bind, connect, getsockname, SockFlag, SockaddrIn};

/// All operations return `Errno` rather than a rich error: the error is forwarded
///  verbatim to the requesting client, which raises it as if its own syscall failed.
#[cfg_attr(test, automock)]
pub trait HostSockets: Send + Sync + 'static {
    /// Creates a host socket with the client's unmodified arguments, including any
    ///  type flags like `SOCK_NONBLOCK`.
    fn create_socket(&self, domain: i32, sock_type: i32, protocol: i32) -> Result<OwnedFd, Errno>;

    /// Binds to an ephemeral port on `host_ip`, leaving the port choice to the
    ///  kernel.
    fn bind_ephemeral(&self, fd: RawFd, host_ip: Ipv4Addr) -> Result<(), Errno>;

    /// The port the kernel actually assigned, in host byte order.
    fn bound_port(&self, fd: RawFd) -> Result<u16, Errno>;

    /// Accepts one connection, blocking even if the listening socket is in
    ///  non-blocking mode. Must only be called from a blocking-capable context.
    fn accept_blocking(&self, fd: RawFd, flags: i32) -> Result<OwnedFd, Errno>;

    fn connect(&self, fd: RawFd, host_ip: Ipv4Addr, host_port: u16) -> Result<(), Errno>;
}

pub struct NixHostSockets;

impl HostSockets for NixHostSockets {
    fn create_socket(&self, domain: i32, sock_type: i32, protocol: i32) -> Result<OwnedFd, Errno> {
        // raw libc call: sock_type carries client-chosen flag bits that the typed
        //  nix wrapper cannot represent
        let raw = unsafe { libc::socket(domain, sock_type, protocol) };
        let raw = Errno::result(raw)?;
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    }

    fn bind_ephemeral(&self, fd: RawFd, host_ip: Ipv4Addr) -> Result<(), Errno> {
        let [a, b, c, d] = host_ip.octets();
        bind(fd, &SockaddrIn::new(a, b, c, d, 0))
    }

    fn bound_port(&self, fd: RawFd) -> Result<u16, Errno> {
        Ok(getsockname::<SockaddrIn>(fd)?.port())
    }

    fn accept_blocking(&self, fd: RawFd, flags: i32) -> Result<OwnedFd, Errno> {
        // the client may have put the socket into non-blocking mode, but the accept
        //  semantics of the control protocol are blocking. Clear O_NONBLOCK for the
        //  duration of the call and restore it afterwards, also on failure.
        let original = OFlag::from_bits_retain(fcntl(fd, FcntlArg::F_GETFL)?);
        if original.contains(OFlag::O_NONBLOCK) {
            fcntl(fd, FcntlArg::F_SETFL(original & !OFlag::O_NONBLOCK))?;
        }

        let accepted = accept4(fd, SockFlag::from_bits_truncate(flags));

        if original.contains(OFlag::O_NONBLOCK) {
            let _ = fcntl(fd, FcntlArg::F_SETFL(original));
        }

        let raw = accepted?;
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    }

    fn connect(&self, fd: RawFd, host_ip: Ipv4Addr, host_port: u16) -> Result<(), Errno> {
        let [a, b, c, d] = host_ip.octets();
        connect(fd, &SockaddrIn::new(a, b, c, d, host_port))
    }
}

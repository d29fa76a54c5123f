//! Transfer of open file descriptors across the control channel.
//!
//! A descriptor number has no meaning across the unix domain boundary; the kernel
//!  file object itself is transferred via `SCM_RIGHTS` ancillary data. Exactly one
//!  descriptor travels per ancillary message, accompanied by a 2-byte dummy payload
//!  (some platforms require a non-empty regular payload alongside ancillary data).
//!
//! The sending side may legitimately have no descriptor to transfer (a host operation
//!  failed); it then sends the dummy payload without ancillary data so the receiver's
//!  framing stays deterministic.

use std::io;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use anyhow::Context;
use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use tokio::io::Interest;
use tokio::net::UnixStream;

const DUMMY_PAYLOAD: [u8; 2] = [0; 2];

pub async fn send_fd(stream: &UnixStream, fd: Option<BorrowedFd<'_>>) -> anyhow::Result<()> {
    let raw_fds = fd.map(|fd| [fd.as_raw_fd()]);

    stream
        .async_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(&DUMMY_PAYLOAD)];
            let mut cmsgs = Vec::new();
            if let Some(fds) = &raw_fds {
                cmsgs.push(ControlMessage::ScmRights(fds));
            }
            match sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None) {
                Ok(_) => Ok(()),
                Err(Errno::EWOULDBLOCK) => Err(io::ErrorKind::WouldBlock.into()),
                Err(e) => Err(io::Error::from(e)),
            }
        })
        .await
        .context("sending file descriptor over the control channel")?;
    Ok(())
}

/// Returns `Ok(None)` if the peer's message carried no descriptor - callers decide
///  whether that is acceptable for the operation at hand.
pub async fn recv_fd(stream: &UnixStream) -> anyhow::Result<Option<OwnedFd>> {
    let fd = stream
        .async_io(Interest::READABLE, || {
            let mut dummy = [0u8; 2];
            let mut iov = [IoSliceMut::new(&mut dummy)];
            let mut cmsg_buf = cmsg_space!([RawFd; 1]);

            let msg = match recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            ) {
                Ok(msg) => msg,
                Err(Errno::EWOULDBLOCK) => return Err(io::ErrorKind::WouldBlock.into()),
                Err(e) => return Err(io::Error::from(e)),
            };

            let mut received = None;
            for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    received = fds
                        .first()
                        .map(|&raw| unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
            Ok(received)
        })
        .await
        .context("receiving file descriptor over the control channel")?;
    Ok(fd)
}

#[cfg(test)]
mod test {
    use std::os::fd::AsFd;

    use super::*;

    #[tokio::test]
    async fn test_fd_round_trip() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let (pipe_read, pipe_write) = nix::unistd::pipe().unwrap();

        send_fd(&sender, Some(pipe_write.as_fd())).await.unwrap();
        let received = recv_fd(&receiver).await.unwrap().expect("expected a descriptor");

        // the received descriptor must refer to the same pipe object
        nix::unistd::write(&received, b"ping").unwrap();
        let mut buf = [0u8; 4];
        nix::unistd::read(pipe_read.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_message_without_fd_yields_none() {
        let (sender, receiver) = UnixStream::pair().unwrap();

        send_fd(&sender, None).await.unwrap();
        assert!(recv_fd(&receiver).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sequence_of_fd_messages() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let (_pipe_read, pipe_write) = nix::unistd::pipe().unwrap();

        send_fd(&sender, Some(pipe_write.as_fd())).await.unwrap();
        send_fd(&sender, None).await.unwrap();
        send_fd(&sender, Some(pipe_write.as_fd())).await.unwrap();

        assert!(recv_fd(&receiver).await.unwrap().is_some());
        assert!(recv_fd(&receiver).await.unwrap().is_none());
        assert!(recv_fd(&receiver).await.unwrap().is_some());
    }
}

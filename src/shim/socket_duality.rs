//! Bookkeeping for sockets that exist twice: the overlay descriptor the application
//!  holds and the host descriptor the router created for it.
//!
//! The application's descriptor number must never change - it may be stored in
//!  application data structures, registered with epoll, or inherited by children.
//!  When a host descriptor takes over, it is renumbered under the application's
//!  number via `dup2` instead of handing the application a new number.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use anyhow::Context;
use tracing::trace;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OverlayState {
    Created,
    Bound,
    Connected,
}

pub struct SocketDuality {
    overlay: OwnedFd,
    host: Option<OwnedFd>,
    state: OverlayState,
    is_normal: bool,
}

impl SocketDuality {
    /// A socket inside the overlay prefix, subject to router mediation.
    pub fn virtualized(overlay: OwnedFd) -> SocketDuality {
        SocketDuality {
            overlay,
            host: None,
            state: OverlayState::Created,
            is_normal: false,
        }
    }

    /// A socket outside the overlay prefix; all operations pass through untouched.
    pub fn normal(fd: OwnedFd) -> SocketDuality {
        SocketDuality {
            overlay: fd,
            host: None,
            state: OverlayState::Created,
            is_normal: true,
        }
    }

    /// The descriptor number the application knows. Stable for the lifetime of this
    ///  record, across host-descriptor adoption.
    pub fn application_fd(&self) -> BorrowedFd<'_> {
        self.overlay.as_fd()
    }

    pub fn state(&self) -> OverlayState {
        self.state
    }

    pub fn is_normal(&self) -> bool {
        self.is_normal
    }

    pub fn mark_bound(&mut self) {
        debug_assert_eq!(self.state, OverlayState::Created);
        self.state = OverlayState::Bound;
    }

    pub fn mark_connected(&mut self) {
        debug_assert_eq!(self.state, OverlayState::Created);
        self.state = OverlayState::Connected;
    }

    /// Replaces the kernel object behind the application's descriptor number with
    ///  `host`, closing both the previous object and the donor number.
    pub fn adopt_host_fd(&mut self, host: OwnedFd) -> anyhow::Result<()> {
        trace!("renumbering host fd {} under application fd {}", host.as_raw_fd(), self.overlay.as_raw_fd());
        nix::unistd::dup2(host.as_raw_fd(), self.overlay.as_raw_fd())
            .context("renumbering the host descriptor")?;
        // the donor number closes when `host` drops; `self.overlay` keeps its number
        //  but now refers to the host kernel object
        self.host = Some(host);
        Ok(())
    }
}

//! Decides which addresses belong to the overlay. Everything inside the configured
//!  CIDR prefix is virtualized through the router; everything outside is handled by
//!  the regular socket API.

use std::net::{IpAddr, Ipv4Addr};

use anyhow::{bail, Context};
use tracing::warn;

pub const PREFIX_ENV_VAR: &str = "VNET_PREFIX";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct OverlayPrefix {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl OverlayPrefix {
    pub fn parse(cidr: &str) -> anyhow::Result<OverlayPrefix> {
        let Some((addr_part, len_part)) = cidr.split_once('/') else {
            bail!("not in CIDR notation: {:?}", cidr);
        };
        let network = addr_part
            .parse::<Ipv4Addr>()
            .with_context(|| format!("invalid network address in {:?}", cidr))?;
        let prefix_len = len_part
            .parse::<u8>()
            .with_context(|| format!("invalid prefix length in {:?}", cidr))?;
        if prefix_len > 32 {
            bail!("prefix length out of range in {:?}", cidr);
        }
        Ok(OverlayPrefix {
            network,
            prefix_len,
        })
    }

    /// `0.0.0.0/0` - every IPv4 address is treated as an overlay address.
    pub fn match_all() -> OverlayPrefix {
        OverlayPrefix {
            network: Ipv4Addr::UNSPECIFIED,
            prefix_len: 0,
        }
    }

    /// Reads the prefix from the environment. An unset or unparseable value
    ///  degrades to match-all with a warning rather than failing: a shim that
    ///  refuses to start would take the whole application down with it.
    pub fn from_env() -> OverlayPrefix {
        match std::env::var(PREFIX_ENV_VAR) {
            Ok(value) => match OverlayPrefix::parse(&value) {
                Ok(prefix) => prefix,
                Err(e) => {
                    warn!("unusable {} value {:?} ({}) - virtualizing all addresses", PREFIX_ENV_VAR, value, e);
                    OverlayPrefix::match_all()
                }
            },
            Err(_) => {
                warn!("{} is not set - virtualizing all addresses", PREFIX_ENV_VAR);
                OverlayPrefix::match_all()
            }
        }
    }

    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            // a 32-bit shift by 32 is undefined, handle /0 explicitly
            0
        }
        else {
            u32::MAX << (32 - self.prefix_len)
        }
    }

    /// IPv6 addresses are outside the overlay unless they are IPv4-mapped, in which
    ///  case the embedded IPv4 address decides.
    pub fn contains(&self, addr: IpAddr) -> bool {
        let v4 = match addr {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => v4,
                None => return false,
            },
        };
        (v4.to_bits() & self.mask()) == (self.network.to_bits() & self.mask())
    }
}

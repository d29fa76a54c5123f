//! Fixed-layout message bodies for the control channel and the gossip channel.
//!
//! Plain integers (domains, flags, status codes) travel in host byte order like the
//!  envelope header. IP addresses and ports travel in network byte order - they are
//!  forwarded the way the kernel socket API hands them out.

use std::net::Ipv4Addr;

use anyhow::bail;
use bytes::{Buf, BufMut};

fn ensure_remaining(buf: &impl Buf, needed: usize, what: &str) -> anyhow::Result<()> {
    if buf.remaining() < needed {
        bail!("{} body too short: {} bytes, need {}", what, buf.remaining(), needed);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SocketRequest {
    pub domain: i32,
    pub sock_type: i32,
    pub protocol: i32,
}
impl SocketRequest {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i32_ne(self.domain);
        buf.put_i32_ne(self.sock_type);
        buf.put_i32_ne(self.protocol);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<SocketRequest> {
        ensure_remaining(buf, 12, "socket request")?;
        Ok(SocketRequest {
            domain: buf.get_i32_ne(),
            sock_type: buf.get_i32_ne(),
            protocol: buf.get_i32_ne(),
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BindRequest {
    pub virtual_ip: Ipv4Addr,
    pub virtual_port: u16,
}
impl BindRequest {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.virtual_ip.to_bits());
        buf.put_u16(self.virtual_port);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<BindRequest> {
        ensure_remaining(buf, 6, "bind request")?;
        Ok(BindRequest {
            virtual_ip: Ipv4Addr::from_bits(buf.get_u32()),
            virtual_port: buf.get_u16(),
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AcceptRequest {
    pub flags: i32,
}
impl AcceptRequest {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i32_ne(self.flags);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<AcceptRequest> {
        ensure_remaining(buf, 4, "accept request")?;
        Ok(AcceptRequest {
            flags: buf.get_i32_ne(),
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConnectRequest {
    pub virtual_ip: Ipv4Addr,
    pub virtual_port: u16,
}
impl ConnectRequest {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.virtual_ip.to_bits());
        buf.put_u16(self.virtual_port);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ConnectRequest> {
        ensure_remaining(buf, 6, "connect request")?;
        Ok(ConnectRequest {
            virtual_ip: Ipv4Addr::from_bits(buf.get_u32()),
            virtual_port: buf.get_u16(),
        })
    }
}

/// All four request kinds answer with the same body: 0 on success, `-errno` on a
///  failed host operation. Descriptors travel separately as ancillary data.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StatusResponse {
    pub status: i32,
}
impl StatusResponse {
    pub const SERIALIZED_SIZE: usize = size_of::<i32>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i32_ne(self.status);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<StatusResponse> {
        ensure_remaining(buf, Self::SERIALIZED_SIZE, "status response")?;
        Ok(StatusResponse {
            status: buf.get_i32_ne(),
        })
    }
}

/// The authoritative translation from an overlay 2-tuple to a host 2-tuple. Owned by
///  the mapping manager; gossip messages carry copies, never references.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AddressMapping {
    pub virtual_ip: Ipv4Addr,
    pub host_ip: Ipv4Addr,
    pub virtual_port: u16,
    pub host_port: u16,
}
impl AddressMapping {
    pub const SERIALIZED_SIZE: usize = 2 * size_of::<u32>() + 2 * size_of::<u16>();

    /// The overlay 2-tuple packed into a single value for table lookup. Uniqueness is
    ///  enforced on this key.
    pub fn key(&self) -> u64 {
        (self.virtual_port as u64) << 32 | self.virtual_ip.to_bits() as u64
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.virtual_ip.to_bits());
        buf.put_u32(self.host_ip.to_bits());
        buf.put_u16(self.virtual_port);
        buf.put_u16(self.host_port);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<AddressMapping> {
        ensure_remaining(buf, Self::SERIALIZED_SIZE, "address mapping")?;
        Ok(AddressMapping {
            virtual_ip: Ipv4Addr::from_bits(buf.get_u32()),
            host_ip: Ipv4Addr::from_bits(buf.get_u32()),
            virtual_port: buf.get_u16(),
            host_port: buf.get_u16(),
        })
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::loopback("127.0.0.1", 80, "10.1.2.3", 41000)]
    #[case::zero_port("10.0.0.5", 0, "192.168.1.10", 0)]
    fn test_address_mapping_round_trip(
        #[case] virtual_ip: Ipv4Addr,
        #[case] virtual_port: u16,
        #[case] host_ip: Ipv4Addr,
        #[case] host_port: u16,
    ) {
        let mapping = AddressMapping {
            virtual_ip,
            host_ip,
            virtual_port,
            host_port,
        };

        let mut buf = BytesMut::new();
        mapping.ser(&mut buf);
        assert_eq!(buf.len(), AddressMapping::SERIALIZED_SIZE);

        let deserialized = AddressMapping::try_deser(&mut buf.freeze()).unwrap();
        assert_eq!(deserialized, mapping);
    }

    #[test]
    fn test_address_mapping_wire_layout() {
        let mapping = AddressMapping {
            virtual_ip: Ipv4Addr::new(10, 0, 0, 5),
            host_ip: Ipv4Addr::new(192, 168, 1, 10),
            virtual_port: 80,
            host_port: 41000,
        };

        let mut buf = BytesMut::new();
        mapping.ser(&mut buf);
        // addresses and ports in network byte order, virtual tuple split around the host IP
        assert_eq!(
            &buf[..],
            &[10, 0, 0, 5, 192, 168, 1, 10, 0, 80, 0xa0, 0x28]
        );
    }

    #[test]
    fn test_mapping_key_distinguishes_port_and_ip() {
        let base = AddressMapping {
            virtual_ip: Ipv4Addr::new(10, 0, 0, 5),
            host_ip: Ipv4Addr::new(192, 168, 1, 10),
            virtual_port: 80,
            host_port: 41000,
        };
        let other_port = AddressMapping {
            virtual_port: 81,
            ..base
        };
        let other_ip = AddressMapping {
            virtual_ip: Ipv4Addr::new(10, 0, 0, 6),
            ..base
        };
        let other_host = AddressMapping {
            host_ip: Ipv4Addr::new(172, 16, 0, 1),
            host_port: 1,
            ..base
        };

        assert_ne!(base.key(), other_port.key());
        assert_ne!(base.key(), other_ip.key());
        // the key covers only the virtual tuple
        assert_eq!(base.key(), other_host.key());
    }

    #[rstest]
    #[case::socket(b"\x02\x00\x00\x00\x01\x00\x00\x00\x06\x00\x00\x00" as &[u8])]
    fn test_socket_request_deser_little_endian(#[case] body: &[u8]) {
        // native byte order; this fixture assumes a little-endian host like every
        // deployment target of this crate
        if cfg!(target_endian = "little") {
            let mut buf = body;
            let request = SocketRequest::try_deser(&mut buf).unwrap();
            assert_eq!(
                request,
                SocketRequest {
                    domain: 2,
                    sock_type: 1,
                    protocol: 6
                }
            );
        }
    }

    #[test]
    fn test_requests_round_trip() {
        let mut buf = BytesMut::new();
        BindRequest {
            virtual_ip: Ipv4Addr::new(10, 0, 0, 5),
            virtual_port: 8080,
        }
        .ser(&mut buf);
        let bind = BindRequest::try_deser(&mut buf.split().freeze()).unwrap();
        assert_eq!(bind.virtual_ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(bind.virtual_port, 8080);

        ConnectRequest {
            virtual_ip: Ipv4Addr::new(10, 0, 0, 7),
            virtual_port: 443,
        }
        .ser(&mut buf);
        let connect = ConnectRequest::try_deser(&mut buf.split().freeze()).unwrap();
        assert_eq!(connect.virtual_port, 443);

        AcceptRequest { flags: 0x800 }.ser(&mut buf);
        assert_eq!(
            AcceptRequest::try_deser(&mut buf.split().freeze()).unwrap().flags,
            0x800
        );

        StatusResponse { status: -111 }.ser(&mut buf);
        assert_eq!(
            StatusResponse::try_deser(&mut buf.split().freeze()).unwrap().status,
            -111
        );
    }

    #[test]
    fn test_deser_tolerates_trailing_padding() {
        // a C peer sends sizeof(struct) bytes, which may include alignment padding
        let mut buf = BytesMut::new();
        BindRequest {
            virtual_ip: Ipv4Addr::new(10, 0, 0, 5),
            virtual_port: 80,
        }
        .ser(&mut buf);
        buf.put_u16(0);

        let bind = BindRequest::try_deser(&mut buf.freeze()).unwrap();
        assert_eq!(bind.virtual_port, 80);
    }

    #[test]
    fn test_deser_short_body_fails() {
        let mut buf = &b"\x01\x02"[..];
        assert!(BindRequest::try_deser(&mut buf).is_err());
        let mut buf = &b""[..];
        assert!(StatusResponse::try_deser(&mut buf).is_err());
        let mut buf = &b"\x01\x02\x03\x04\x05\x06\x07"[..];
        assert!(AddressMapping::try_deser(&mut buf).is_err());
    }
}

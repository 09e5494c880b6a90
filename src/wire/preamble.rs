use std::net::{IpAddr, Ipv6Addr};

use anyhow::bail;
use bytes::{Buf, BufMut};

pub const PREAMBLE_LEN: usize = 30;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionKind {
    /// a regular peer connection that continues with message framing
    Client,
    /// a side channel used for key exchange
    Handshake,
}

impl ConnectionKind {
    const CLIENT_TAG: &'static [u8; 8] = b"client\0\0";
    const HANDSHAKE_TAG: &'static [u8; 8] = b"handshak";

    fn tag(&self) -> &'static [u8; 8] {
        match self {
            ConnectionKind::Client => Self::CLIENT_TAG,
            ConnectionKind::Handshake => Self::HANDSHAKE_TAG,
        }
    }

    fn from_tag(tag: &[u8; 8]) -> anyhow::Result<ConnectionKind> {
        if tag == Self::CLIENT_TAG {
            Ok(ConnectionKind::Client)
        }
        else if tag == Self::HANDSHAKE_TAG {
            Ok(ConnectionKind::Handshake)
        }
        else {
            bail!("unknown connection kind {:?}", String::from_utf8_lossy(tag))
        }
    }
}

/// The fixed-size record a dialing peer sends before the first framed message. It tells the
///  accepting side what kind of connection this is and where the dialing peer's own server
///  can be reached.
///
/// ```ascii
/// 0: kind (8 bytes, ASCII, NUL padded)
/// 8: advertised address (16 bytes, IPv6 or IPv4-mapped, all zero if unspecified)
/// 24: server port (u16)
/// 26: channel id (u32)
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Preamble {
    pub kind: ConnectionKind,
    pub advertised_ip: Option<IpAddr>,
    pub server_port: u16,
    pub channel_id: u32,
}

impl Preamble {
    pub fn client(advertised_ip: Option<IpAddr>, server_port: u16) -> Preamble {
        Preamble {
            kind: ConnectionKind::Client,
            advertised_ip,
            server_port,
            channel_id: 0,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.kind.tag());

        let ip = match self.advertised_ip {
            None => Ipv6Addr::UNSPECIFIED,
            Some(IpAddr::V4(ip)) => ip.to_ipv6_mapped(),
            Some(IpAddr::V6(ip)) => ip,
        };
        buf.put_slice(&ip.octets());
        buf.put_u16(self.server_port);
        buf.put_u32(self.channel_id);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Preamble> {
        if buf.remaining() < PREAMBLE_LEN {
            bail!("preamble needs {} bytes, got {}", PREAMBLE_LEN, buf.remaining());
        }

        let mut tag = [0u8; 8];
        buf.copy_to_slice(&mut tag);
        let kind = ConnectionKind::from_tag(&tag)?;

        let mut octets = [0u8; 16];
        buf.copy_to_slice(&mut octets);
        let ip = Ipv6Addr::from(octets);
        let advertised_ip = if ip.is_unspecified() {
            None
        }
        else {
            match ip.to_ipv4_mapped() {
                Some(v4) => Some(IpAddr::V4(v4)),
                None => Some(IpAddr::V6(ip)),
            }
        };

        let server_port = buf.get_u16();
        let channel_id = buf.get_u32();

        Ok(Preamble {
            kind,
            advertised_ip,
            server_port,
            channel_id,
        })
    }

    pub fn encode(&self) -> [u8; PREAMBLE_LEN] {
        let mut result = [0u8; PREAMBLE_LEN];
        self.ser(&mut &mut result[..]);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::client_unspecified(Preamble::client(None, 9000),
        b"client\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\x23\x28\0\0\0\0")]
    #[case::client_v4(Preamble::client(Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))), 1),
        b"client\0\0\0\0\0\0\0\0\0\0\0\0\xff\xff\x0a\0\0\x01\0\x01\0\0\0\0")]
    #[case::handshake(Preamble { kind: ConnectionKind::Handshake, advertised_ip: Some(IpAddr::from_str("::1").unwrap()), server_port: 2, channel_id: 7 },
        b"handshak\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\x01\0\x02\0\0\0\x07")]
    fn test_preamble_encode(#[case] preamble: Preamble, #[case] raw: &[u8]) {
        assert_eq!(&preamble.encode()[..], raw);

        let mut buf = raw;
        assert_eq!(Preamble::try_deser(&mut buf).unwrap(), preamble);
        assert!(buf.is_empty());
    }

    #[rstest]
    #[case::too_short(b"client\0\0\0\0")]
    #[case::unknown_kind(b"server\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\x23\x28\0\0\0\0")]
    #[case::wrong_padding(b"client  \0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\x23\x28\0\0\0\0")]
    fn test_preamble_invalid(#[case] mut raw: &[u8]) {
        assert!(Preamble::try_deser(&mut raw).is_err());
    }
}

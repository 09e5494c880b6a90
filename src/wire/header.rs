use bytes::{Buf, BufMut};

use crate::wire::command::CommandCode;

/// Size of the fixed message header on the wire. Peers rely on this, so it can never change.
pub const HEADER_LEN: usize = 21;

/// The fixed-size header preceding every message body. All numbers are big endian:
///
/// ```ascii
/// 0: tag (i16)
/// 2: payload length (u32), number of body bytes following the header
/// 6: data length (u32), reserved
/// 10: command (u8)
/// 11: request id (i64)
/// 19: protocol version (u16)
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct MessageHeader {
    pub tag: i16,
    pub payload_len: u32,
    pub data_len: u32,
    pub command: CommandCode,
    pub request_id: i64,
    pub version: u16,
}

impl MessageHeader {
    pub fn new(command: CommandCode, version: u16, payload_len: u32) -> MessageHeader {
        MessageHeader {
            tag: 0,
            payload_len,
            data_len: 0,
            command,
            request_id: 0,
            version,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i16(self.tag);
        buf.put_u32(self.payload_len);
        buf.put_u32(self.data_len);
        buf.put_u8(self.command.0);
        buf.put_i64(self.request_id);
        buf.put_u16(self.version);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        let tag = buf.try_get_i16()?;
        let payload_len = buf.try_get_u32()?;
        let data_len = buf.try_get_u32()?;
        let command = CommandCode(buf.try_get_u8()?);
        let request_id = buf.try_get_i64()?;
        let version = buf.try_get_u16()?;

        Ok(MessageHeader {
            tag,
            payload_len,
            data_len,
            command,
            request_id,
            version,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut result = [0u8; HEADER_LEN];
        self.ser(&mut &mut result[..]);
        result
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> MessageHeader {
        let mut buf = &raw[..];
        MessageHeader {
            tag: buf.get_i16(),
            payload_len: buf.get_u32(),
            data_len: buf.get_u32(),
            command: CommandCode(buf.get_u8()),
            request_id: buf.get_i64(),
            version: buf.get_u16(),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::zero(MessageHeader::default(), [0u8; 21])]
    #[case::simple(MessageHeader { tag: 1, payload_len: 5, data_len: 0, command: CommandCode(7), request_id: 42, version: 3 },
        *b"\0\x01\0\0\0\x05\0\0\0\0\x07\0\0\0\0\0\0\0\x2a\0\x03")]
    #[case::negative(MessageHeader { tag: -1, payload_len: 0x01020304, data_len: 0x0a0b0c0d, command: CommandCode(0xff), request_id: -2, version: 0xfffe },
        *b"\xff\xff\x01\x02\x03\x04\x0a\x0b\x0c\x0d\xff\xff\xff\xff\xff\xff\xff\xff\xfe\xff\xfe")]
    fn test_header_encode_decode(#[case] header: MessageHeader, #[case] raw: [u8; 21]) {
        assert_eq!(header.encode(), raw);
        assert_eq!(MessageHeader::decode(&raw), header);

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(&buf[..], &raw[..]);
    }

    #[rstest]
    #[case::exact(b"\0\x01\0\0\0\x05\0\0\0\0\x07\0\0\0\0\0\0\0\x2a\0\x03", b"", true)]
    #[case::remainder(b"\0\x01\0\0\0\x05\0\0\0\0\x07\0\0\0\0\0\0\0\x2a\0\x03abc", b"abc", true)]
    #[case::too_short(b"\0\x01\0\0\0\x05\0\0\0\0\x07\0\0\0\0\0\0\0\x2a\0", b"", false)]
    #[case::empty(b"", b"", false)]
    fn test_header_try_deser(#[case] mut buf: &[u8], #[case] buf_after: &[u8], #[case] ok: bool) {
        match MessageHeader::try_deser(&mut buf) {
            Ok(actual) => {
                assert!(ok);
                assert_eq!(actual, MessageHeader { tag: 1, payload_len: 5, data_len: 0, command: CommandCode(7), request_id: 42, version: 3 });
                assert_eq!(buf, buf_after);
            }
            Err(e) => {
                println!("{}", e);
                assert!(!ok);
            }
        }
    }

    #[test]
    fn test_header_len_is_fixed() {
        let header = MessageHeader {
            tag: i16::MAX,
            payload_len: u32::MAX,
            data_len: u32::MAX,
            command: CommandCode(u8::MAX),
            request_id: i64::MIN,
            version: u16::MAX,
        };
        assert_eq!(header.encode().len(), HEADER_LEN);
        assert_eq!(MessageHeader::decode(&header.encode()), header);
    }
}

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::wire::command::CommandCode;
use crate::wire::message::Message;

/// Body of the control message sent to a peer whose protocol version is below the configured
///  minimum. This is the only body the transport produces itself.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BadVersionNotice {
    /// the command of the rejected message
    pub command: CommandCode,
    pub version: u16,
    pub minimum_version: u16,
    /// name of the rejected command, empty if it is not registered
    pub name: String,
}

impl BadVersionNotice {
    pub fn ser(&self, buf: &mut impl BufMut) {
        let name = &self.name.as_bytes()[..self.name.len().min(u8::MAX as usize)];

        buf.put_u8(self.command.0);
        buf.put_u16(self.version);
        buf.put_u16(self.minimum_version);
        buf.put_u8(name.len() as u8);
        buf.put_slice(name);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<BadVersionNotice> {
        let command = CommandCode(buf.try_get_u8()?);
        let version = buf.try_get_u16()?;
        let minimum_version = buf.try_get_u16()?;
        let name_len = buf.try_get_u8()? as usize;
        if buf.remaining() < name_len {
            bail!("bad version notice announces a name of {} bytes, but only {} remain", name_len, buf.remaining());
        }
        let name = String::from_utf8(buf.copy_to_bytes(name_len).to_vec())?;

        Ok(BadVersionNotice {
            command,
            version,
            minimum_version,
            name,
        })
    }

    /// Wraps the notice in a message. The response carries the request id of the rejected
    ///  message so the peer can correlate it, and the minimum version so the peer can decode it.
    pub fn to_message(&self, response_command: CommandCode, request_id: i64) -> Message {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        Message::new(response_command, self.minimum_version, buf.freeze())
            .with_request_id(request_id)
    }

    pub fn from_body(body: &Bytes) -> anyhow::Result<BadVersionNotice> {
        let mut buf = body.clone();
        Self::try_deser(&mut buf)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::named(BadVersionNotice { command: CommandCode(9), version: 1, minimum_version: 3, name: "ReqReg".to_string() },
        b"\x09\0\x01\0\x03\x06ReqReg")]
    #[case::unnamed(BadVersionNotice { command: CommandCode(10), version: 0, minimum_version: 0x102, name: String::new() },
        b"\x0a\0\0\x01\x02\0")]
    fn test_bad_version_ser(#[case] notice: BadVersionNotice, #[case] raw: &[u8]) {
        let mut buf = BytesMut::new();
        notice.ser(&mut buf);
        assert_eq!(&buf[..], raw);

        let mut raw = raw;
        assert_eq!(BadVersionNotice::try_deser(&mut raw).unwrap(), notice);
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::no_name_len(b"\x09\0\x01\0\x03")]
    #[case::name_truncated(b"\x09\0\x01\0\x03\x06Req")]
    fn test_bad_version_truncated(#[case] mut raw: &[u8]) {
        assert!(BadVersionNotice::try_deser(&mut raw).is_err());
    }

    #[test]
    fn test_to_message() {
        let notice = BadVersionNotice { command: CommandCode(9), version: 1, minimum_version: 3, name: "ReqReg".to_string() };
        let msg = notice.to_message(CommandCode::BAD_VERSION, 77);

        assert_eq!(msg.command(), CommandCode::BAD_VERSION);
        assert_eq!(msg.request_id(), 77);
        assert_eq!(msg.version(), 3);
        assert_eq!(msg.header.payload_len as usize, msg.body.len());
        assert_eq!(BadVersionNotice::from_body(&msg.body).unwrap(), notice);
    }
}

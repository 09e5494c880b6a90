use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::command::CommandCode;
use crate::wire::header::{MessageHeader, HEADER_LEN};

/// A complete message: header plus opaque body. The body is never interpreted by the transport.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub body: Bytes,
}

impl Message {
    pub fn new(command: CommandCode, version: u16, body: impl Into<Bytes>) -> Message {
        let body = body.into();
        Message {
            header: MessageHeader::new(command, version, body.len() as u32),
            body,
        }
    }

    pub fn header_only(command: CommandCode, version: u16) -> Message {
        Message {
            header: MessageHeader::new(command, version, 0),
            body: Bytes::new(),
        }
    }

    pub fn from_parts(mut header: MessageHeader, body: Bytes) -> Message {
        header.payload_len = body.len() as u32;
        Message { header, body }
    }

    pub fn with_request_id(mut self, request_id: i64) -> Message {
        self.header.request_id = request_id;
        self
    }

    pub fn with_tag(mut self, tag: i16) -> Message {
        self.header.tag = tag;
        self
    }

    pub fn command(&self) -> CommandCode {
        self.header.command
    }

    pub fn request_id(&self) -> i64 {
        self.header.request_id
    }

    pub fn version(&self) -> u16 {
        self.header.version
    }

    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Copies header and body into a freshly allocated buffer, ready to be written to a socket.
    ///  The payload length is taken from the actual body.
    pub fn to_frame(&self) -> BytesMut {
        let mut header = self.header;
        header.payload_len = self.body.len() as u32;

        let mut buf = BytesMut::with_capacity(self.frame_len());
        header.ser(&mut buf);
        buf.put_slice(&self.body);
        buf
    }
}

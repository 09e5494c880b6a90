use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::wire::header::{MessageHeader, HEADER_LEN};
use crate::wire::message::Message;
use crate::wire::preamble::Preamble;

/// A peer that speaks the framing protocol directly on a socket, without any of the server's
///  machinery
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<TestClient> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(TestClient { stream })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    pub async fn send_preamble(&mut self, preamble: &Preamble) -> anyhow::Result<()> {
        self.send_raw(&preamble.encode()).await
    }

    pub async fn send(&mut self, message: &Message) -> anyhow::Result<()> {
        self.send_raw(&message.to_frame()).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> anyhow::Result<Message> {
        let mut header_buf = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header_buf).await?;
        let header = MessageHeader::decode(&header_buf);

        let mut body = vec![0u8; header.payload_len as usize];
        self.stream.read_exact(&mut body).await?;
        Ok(Message::from_parts(header, Bytes::from(body)))
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> anyhow::Result<Message> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| anyhow!("no message received within {:?}", timeout))?
    }

    /// Waits for the server to close the connection, failing if data arrives or the connection
    ///  is still open after the timeout
    pub async fn expect_closed(&mut self, timeout: Duration) -> anyhow::Result<()> {
        let mut buf = [0u8; 64];
        match tokio::time::timeout(timeout, self.stream.read(&mut buf)).await {
            Err(_) => bail!("connection still open after {:?}", timeout),
            Ok(Ok(0)) => Ok(()),
            Ok(Ok(n)) => bail!("expected the connection to be closed, received {} bytes", n),
            Ok(Err(_)) => Ok(()),
        }
    }
}

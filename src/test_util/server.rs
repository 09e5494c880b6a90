use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::server::server::{Server, ServerBuilder};

/// A server accepting connections on an ephemeral loopback port
pub struct TestServer {
    pub server: Server,
    pub addr: SocketAddr,
    pub accept_loop: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    pub async fn start(builder: ServerBuilder) -> anyhow::Result<TestServer> {
        let server = builder.build()?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let accepting = server.clone();
        let accept_loop = tokio::spawn(async move {
            accepting.start(listener).await
        });

        Ok(TestServer {
            server,
            addr,
            accept_loop,
        })
    }

    /// stops the server and waits for the accept loop to finish
    pub async fn stop(self) -> anyhow::Result<()> {
        self.server.stop().await;
        self.accept_loop.await?
    }
}

use std::net::IpAddr;
use std::time::Duration;

use anyhow::bail;

use crate::wire::command::CommandCode;
use crate::wire::header::HEADER_LEN;

/// Caps the throughput of the frames of some commands, server wide
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RateLimit {
    pub bytes_per_second: u32,
    /// the limit applies to all commands if this is empty
    pub commands: Vec<CommandCode>,
}

impl RateLimit {
    pub fn applies_to(&self, command: CommandCode) -> bool {
        self.commands.is_empty() || self.commands.contains(&command)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// capacity of each connection's outbound queue and dispatch queue
    pub buffer_size: usize,

    /// 0 means unlimited
    pub max_connections: usize,

    /// messages with a lower protocol version are answered with a bad-version notice and the
    ///  connection is closed
    pub min_version: u16,

    /// Upper bound for the payload length declared in a header. A peer declaring more is treated
    ///  as broken, and its connection is closed before anything is allocated.
    pub max_frame_size: u32,

    /// maximum number of bytes per individual socket read or write
    pub io_chunk_size: usize,

    /// deadline for every individual read, renewed before each read
    pub read_timeout: Duration,
    /// deadline for every individual write, renewed before each write
    pub write_timeout: Duration,

    /// deadline for reading the preamble of an accepted connection
    pub handshake_timeout: Duration,
    /// Whether accepted connections start with a preamble, and dialed connections send one.
    ///  All nodes of a network must agree on this.
    pub expect_preamble: bool,
    /// the port of this node's server, advertised in preambles of dialed connections
    pub server_port: u16,
    /// the address advertised in preambles, `None` to let the peer use the connection's address
    pub advertised_ip: Option<IpAddr>,

    pub bad_version_command: CommandCode,
    /// how long to keep a connection open after sending a bad-version notice so the peer can
    ///  read it
    pub bad_version_linger: Duration,

    pub traffic_sample_interval: Duration,

    /// limit for reading message bodies
    pub download_limit: Option<RateLimit>,
    /// limit for writing frames
    pub upload_limit: Option<RateLimit>,

    /// how often a persistent dialed connection is redialed after it was closed, before giving up
    pub reconnect_attempts: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig::new(0)
    }
}

impl ServerConfig {
    pub fn new(server_port: u16) -> ServerConfig {
        ServerConfig {
            buffer_size: 100,
            max_connections: 0,
            min_version: 0,
            max_frame_size: 16*1024*1024,
            io_chunk_size: 1024,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            expect_preamble: false,
            server_port,
            advertised_ip: None,
            bad_version_command: CommandCode::BAD_VERSION,
            bad_version_linger: Duration::from_millis(500),
            traffic_sample_interval: Duration::from_secs(1),
            download_limit: None,
            upload_limit: None,
            reconnect_attempts: 3,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.buffer_size == 0 {
            bail!("buffer size must be positive");
        }
        if self.io_chunk_size == 0 {
            bail!("I/O chunk size must be positive");
        }
        if (self.max_frame_size as usize) < HEADER_LEN {
            bail!("maximum frame size {} is too small", self.max_frame_size);
        }
        if self.read_timeout.is_zero() || self.write_timeout.is_zero() || self.handshake_timeout.is_zero() {
            bail!("timeouts must be positive");
        }
        if self.traffic_sample_interval.is_zero() {
            bail!("traffic sample interval must be positive");
        }
        for limit in self.download_limit.iter().chain(self.upload_limit.iter()) {
            // a single chunk must fit into the limiter's burst
            if (limit.bytes_per_second as usize) < self.io_chunk_size {
                bail!("rate limit of {} bytes per second is below the I/O chunk size {}", limit.bytes_per_second, self.io_chunk_size);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new(9000);
        assert_eq!(config.server_port, 9000);
        assert_eq!(config.buffer_size, 100);
        assert_eq!(config.max_connections, 0);
        assert_eq!(config.io_chunk_size, 1024);
        assert_eq!(config.bad_version_linger, Duration::from_millis(500));
        assert_eq!(config.download_limit, None);
        assert_eq!(config.reconnect_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case::all_commands(vec![], CommandCode(1), true)]
    #[case::listed(vec![CommandCode(1), CommandCode(5)], CommandCode(5), true)]
    #[case::not_listed(vec![CommandCode(1), CommandCode(5)], CommandCode(2), false)]
    fn test_rate_limit_applies_to(#[case] commands: Vec<CommandCode>, #[case] command: CommandCode, #[case] expected: bool) {
        let limit = RateLimit { bytes_per_second: 1024, commands };
        assert_eq!(limit.applies_to(command), expected);
    }

    #[rstest]
    #[case::buffer_size(ServerConfig { buffer_size: 0, ..Default::default() })]
    #[case::chunk_size(ServerConfig { io_chunk_size: 0, ..Default::default() })]
    #[case::frame_size(ServerConfig { max_frame_size: 20, ..Default::default() })]
    #[case::read_timeout(ServerConfig { read_timeout: Duration::ZERO, ..Default::default() })]
    #[case::sample_interval(ServerConfig { traffic_sample_interval: Duration::ZERO, ..Default::default() })]
    #[case::download_below_chunk(ServerConfig { download_limit: Some(RateLimit { bytes_per_second: 1000, commands: vec![] }), ..Default::default() })]
    #[case::upload_zero(ServerConfig { upload_limit: Some(RateLimit { bytes_per_second: 0, commands: vec![] }), ..Default::default() })]
    fn test_validate_rejects(#[case] config: ServerConfig) {
        assert!(config.validate().is_err());
    }
}

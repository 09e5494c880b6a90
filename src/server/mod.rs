pub mod backoff;
pub mod config;
pub mod connection;
pub mod connection_registry;
pub mod extensions;
pub mod hooks;
pub mod rate_limit;
pub mod server;
pub mod traffic;

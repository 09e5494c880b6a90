//! Utilities for testing code on top of the transport over loopback sockets: a raw framing
//!  client that plays the peer, recording handlers and hooks, and a server bound to an ephemeral
//!  port.
//!
//! They are part of the regular (non-#[cfg(test)]) code so that applications can use them in
//!  their own tests.

pub mod client;
pub mod handlers;
pub mod server;

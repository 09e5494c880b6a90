pub mod dispatch;
pub mod error;
pub mod server;
pub mod test_util;
pub mod wire;

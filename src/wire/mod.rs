pub mod bad_version;
pub mod command;
pub mod header;
pub mod message;
pub mod preamble;

//! Unix socket protocol between the daemon and its clients.

pub mod client;
pub mod protocol;
pub mod server;

pub mod broker;
pub mod client;
pub mod config;
pub mod pki;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

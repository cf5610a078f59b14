pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod pool;
pub mod protocol;
pub mod server;

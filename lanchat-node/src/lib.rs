//! LAN chat node: multicast discovery, peer directory with liveness, encrypted direct sessions.

pub mod broadcast;
pub mod broker;
pub mod config;
pub mod direct;
pub mod directory;
pub mod log;
pub mod room;

pub use broker::{Broker, BrokerError};
pub use config::Config;
pub use directory::Directory;
pub use room::{Room, SendError};

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod node;
pub mod peer_registry;
pub mod protocol;
pub mod relay;
pub mod router;
pub mod security;
pub mod store_forward;
pub mod transfer;

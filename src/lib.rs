// Library interface for the ethlink node
// Exposes the gateway components for the binary and integration tests

pub mod ca;
pub mod cache_admin;
pub mod config;
pub mod content_id;
pub mod content_proxy;
pub mod content_store;
pub mod domain;
pub mod error;
pub mod gateway_client;
pub mod lock_utils;
pub mod name_resolver;
pub mod node;
pub mod reconciler;
pub mod resolution_cache;
pub mod rpc_proxy;
pub mod server;
pub mod sni;
pub mod trust_store;

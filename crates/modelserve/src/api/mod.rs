//! HTTP protocol layer: hand-rolled request parsing, wire dialects, and the
//! route table.

pub mod http;
pub mod server;
pub mod wire;

pub use server::ApiServer;

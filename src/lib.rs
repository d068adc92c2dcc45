//! Universal OpenAPI-to-RPC tool bridge: turns an OpenAPI 3.x description
//! into a set of callable tools, served identically over stdio, HTTP,
//! WebSocket, and SSE.

pub mod auth;
pub mod compile;
pub mod config;
pub mod error;
pub mod host;
pub mod policy;
pub mod registry;
pub mod rpc;
pub mod schema;
pub mod spec;
pub mod tool;
pub mod transport;

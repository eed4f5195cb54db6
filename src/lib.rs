//! Core library for the realtime content-sharing broker: session
//! membership, chunked content storage, WebSocket event dispatch, and the
//! streaming download endpoint.

pub mod broker;
pub mod config;
pub mod download;
pub mod errors;
pub mod server;
pub mod session;
pub mod store;

//! Model Context Protocol handling
//!
//! JSON-RPC envelopes, content normalization and the session-aware
//! dispatcher.

pub mod content;
pub mod rpc;
pub mod server;

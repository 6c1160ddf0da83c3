//! HTTP transport for the Model Context Protocol
//!
//! Single-shot JSON requests on `.../mcp`, persistent event streams on
//! `.../sse` with their `.../messages` companion, and the public metadata
//! routes.

pub mod handlers;
pub mod sse;

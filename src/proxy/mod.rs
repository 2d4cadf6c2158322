//! The protocol-translating proxy: HTTP surface, transcoders, and the
//! upstream caller.

pub mod error;
pub mod server;
pub mod sse;
pub mod state;
pub mod translation;
pub mod upstream;

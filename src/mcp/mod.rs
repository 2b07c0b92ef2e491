//! JSON-RPC 2.0 tool server over stdio.

pub mod server;
pub mod tools;

pub use server::run_stdio_server;
pub use tools::ToolContext;

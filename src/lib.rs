pub mod config;
pub mod connectors;
pub mod crypto;
pub mod db;
pub mod error;
pub mod ingest;
pub mod mcp;
pub mod output;

pub use error::IngestError;

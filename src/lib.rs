pub mod config;
pub mod embedding;
pub mod errors;
pub mod feedback;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod rerank;
pub mod search;
pub mod service;
pub mod types;

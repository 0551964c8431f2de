pub mod cache;
pub mod chunker;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod generator;
pub mod indexer;
pub mod orchestrator;
pub mod progress;
pub mod vector_index;

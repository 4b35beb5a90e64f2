//! Bulk enrichment of a content backlog through a rate-limited, metered
//! inference service.

pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod health;
pub mod inference;
pub mod media;
pub mod model;
pub mod orchestrator;
pub mod parser;
pub mod prompt;
pub mod resolver;
pub mod retry;
pub mod store;

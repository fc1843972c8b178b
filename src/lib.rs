//! Pluggable document search with zero-downtime reindexing

pub mod config;
pub mod error;
pub mod search;

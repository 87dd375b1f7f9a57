//! SpreadBot Library
//!
//! Cross-exchange spread arbitrage simulator

pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod persistence;
pub mod phase;
pub mod quotes;
pub mod sources;
pub mod spread;
pub mod types;

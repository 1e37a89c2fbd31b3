pub mod classifier;
pub mod config;
pub mod connectors;
pub mod db;
pub mod memory;
pub mod output;
pub mod triage;

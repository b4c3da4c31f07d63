//! CLI command implementations for herakles-scrape-gateway.
//!
//! This module provides implementations for all CLI subcommands:
//! - `targets`: List the resolved instances of all configured targets
//! - `scrape`: Scrape once and print the merged document

pub mod scrape;
pub mod targets;

// Re-export command functions
pub use scrape::command_scrape;
pub use targets::command_targets;

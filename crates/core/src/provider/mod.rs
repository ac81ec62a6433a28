//! Imagery provider abstraction.
//!
//! This module provides an `ImageryProvider` trait covering the provider's search, asset
//! listing, activation and download endpoints, a Planet Data API implementation, and a
//! `SearchClient` that retries transient search failures.

mod client;
mod config;
mod planet;
mod types;

pub use client::SearchClient;
pub use config::ProviderConfig;
pub use planet::PlanetClient;
pub use types::*;

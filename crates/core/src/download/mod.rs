//! Streaming download of active assets into staging.

mod config;
mod engine;
mod types;

pub use config::DownloadConfig;
pub use engine::DownloadEngine;
pub use types::*;

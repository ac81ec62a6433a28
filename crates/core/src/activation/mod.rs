//! Asset activation.
//!
//! Products must be activated server-side before their bytes can be downloaded. The
//! `Activator` picks the first available product type, triggers activation when needed, and
//! polls until the product reports `active`, bounded by a poll count, a wall-clock budget, a
//! consecutive-error budget, and a cancellation token.

mod activator;
mod config;
mod types;

pub use activator::Activator;
pub use config::ActivationConfig;
pub use types::*;

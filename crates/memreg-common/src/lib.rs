#![doc = "Common types shared across the cluster-memreg workspace."]

pub mod config;
pub mod error;
pub mod metrics;
pub mod state;
pub mod units;

pub use config::*;
pub use error::*;
pub use metrics::*;
pub use state::*;
pub use units::*;

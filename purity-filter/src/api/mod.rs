//! HTTP API handlers

pub mod filter;
pub mod health;
pub mod license;
pub mod paywall;

pub use filter::{filter_batch, filter_routes};
pub use health::{health_check, health_routes};
pub use license::{get_license, license_routes};
pub use paywall::{paywall_middleware, LICENSE_HEADER};

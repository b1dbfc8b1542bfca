//! HTTP client for the provider's fleet API.

mod client;
mod types;

pub use client::{BoundingBox, HttpFleetApi, HttpFleetApiConfig};
pub use types::parse_devices;

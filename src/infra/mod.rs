pub mod fleet_http;
pub mod tokens;

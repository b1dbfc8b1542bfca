pub mod archive;
pub mod classify;
pub mod diff;
pub mod fetch;
pub mod fleet;
pub mod infra;
pub mod output;
pub mod pipeline;
pub mod services;
pub mod shutdown;
pub mod sink;
pub mod source;
pub mod stats;
pub mod tracker;
pub mod trip;

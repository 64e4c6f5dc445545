//! Running the hub as a standalone HTTP service.

pub mod hot_reload;
pub mod server;

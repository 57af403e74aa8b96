//! CLI command modules.

pub mod address;
pub mod http;
pub mod resolve;
pub mod status;

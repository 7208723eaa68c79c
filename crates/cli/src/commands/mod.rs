//! CLI command implementations

pub mod abort;
pub mod report;
pub mod status;

//! Core types, wire protocol, config, and errors for RoleCall.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

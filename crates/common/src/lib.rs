//! Shared types for the saga coordinator workspace.

pub mod types;

pub use types::{OrderId, ParseOrderIdError};

//! Shared types for the key server workspace

mod error;

pub use error::{Error, Result};

//! Core utilities and common types for plughost.

pub mod error;
pub mod types;

pub use error::{Error, LoadError, LoadResult, Result};
pub use types::*;

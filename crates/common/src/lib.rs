//! Common utilities and types shared across the SMTP health check components.

pub mod error;
pub mod logging;

pub use error::{Error, Result};

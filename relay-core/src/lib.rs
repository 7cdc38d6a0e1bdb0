#![forbid(unsafe_code)]

pub mod config;
pub mod error;

pub use config::{BufferConfig, RelayConfig, SessionConfig};
pub use error::{RelayError, RelayResult};

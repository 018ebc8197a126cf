pub mod chunker;
pub mod config;
pub mod error;
pub mod loader;
pub mod retry;
pub mod traits;
pub mod types;

pub use error::{Error, Result};

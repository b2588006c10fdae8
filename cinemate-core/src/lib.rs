pub mod auth;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod persist;

pub use config::Config;
pub use error::{Error, Result};

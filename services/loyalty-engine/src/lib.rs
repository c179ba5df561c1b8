pub mod auth;
pub mod config;
pub mod database;
pub mod errors;
pub mod handlers;

pub use config::Config;
pub use errors::{ApiError, Result};

//! HTTP 中间件

pub mod auth;

pub use auth::{verify_api_key, RequireApiKey};

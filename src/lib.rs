//! authgate: library crate for the gateway binary and integration tests.

pub mod api;
pub mod app;
pub mod cache;
pub mod clock;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod proxy;
pub mod store;

pub use app::AppState;

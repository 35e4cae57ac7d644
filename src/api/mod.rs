pub mod client;
pub mod models;

pub use client::{ApiClient, ApiResponse};

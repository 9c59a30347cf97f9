// Middleware module - Axum middleware

pub mod auth;

pub use auth::admission_middleware;

pub mod authority;
pub mod backpressure;
pub mod config;
pub mod embedding;
pub mod idempotency;

pub mod batches;
pub mod chat;
pub mod collections;
pub mod documents;
pub mod ingestion_ops;
pub mod liveness;
pub mod readiness;
pub mod retrieval;

//! The broker core: the ingestion path and recovery replay.
pub mod engine;

pub use engine::{Broker, IngestOutcome, RejectReason};

#[cfg(test)]
pub(crate) mod test_support;

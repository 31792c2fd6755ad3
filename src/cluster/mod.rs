//! Multi-process deployment.
//!
//! One coordinator process owns the sled log and the bus hub; any number of
//! worker processes run the client-facing gateway and reach both through a
//! [`ClusterLink`]. Sequence ids and dedup are therefore decided in one
//! place, while fan-out reaches every worker's connections.

pub mod coordinator;
pub mod link;
pub mod message;

pub use coordinator::Coordinator;
pub use link::ClusterLink;

#[cfg(test)]
mod tests;

//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `seqrelay` application.
//!
//! This module centralizes the error types and the logging bootstrap.

pub mod error;
pub mod logging;

pub use error::{BusError, RelayError, StoreError};

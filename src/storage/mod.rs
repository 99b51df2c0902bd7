//! Storage Module
//!
//! This module provides durable bookkeeping for the witness service: one row per
//! observed transfer with its processing status, the token pair whitelist and
//! the scan cursor per cashier.

pub mod recorder;

// Re-export for convenience
pub use recorder::Recorder;

//! Resilience primitives

pub mod bulkhead;

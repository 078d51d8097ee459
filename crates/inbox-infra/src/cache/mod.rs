//! Short-lived state stores keyed by random tokens

pub mod link_state;
pub mod redis;

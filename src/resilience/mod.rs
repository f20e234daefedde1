//! Retry and drain-coordination helpers.

pub mod retry;
pub mod drain;

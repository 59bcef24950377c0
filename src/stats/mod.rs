//! Statistics snapshots

pub mod metrics;

pub use metrics::{OutputStats, StreamStats};

//! Statistics for the registry and its reclamation scheduler

pub mod metrics;

pub use metrics::{ReclaimStats, RegistryStats};

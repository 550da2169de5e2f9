//! Custom Resource Definitions for the Cluster Engine Operator
//!
//! This module contains the CRD types:
//! - ClusterEngine: declared desired state of the platform and its status

pub mod cluster_engine;

pub use cluster_engine::*;

// Re-export common types for convenience
pub use chrono::{DateTime, Utc};
pub use std::collections::BTreeMap;

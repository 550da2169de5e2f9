//! Resource Store Adapters
//!
//! Provides adapters implementing [`ResourceStore`](crate::domain::ResourceStore):
//! - Kubernetes: live API server via kube-rs
//! - Memory: in-process store with API server semantics

pub mod kubernetes;
pub mod memory;

pub use kubernetes::*;
pub use memory::*;

//! Domain layer - Resource addressing and port definitions
//!
//! Ports implemented by the store, environment and upgrade adapters.

pub mod ports;
pub mod resource;

pub use ports::*;
pub use resource::*;

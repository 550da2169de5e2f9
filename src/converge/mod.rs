//! Convergence Engine
//!
//! Makes the resource store match rendered resources:
//! - [`apply`]: owner stamping, create-if-absent, forced apply, and removal
//! - [`teardown`]: dependency-ordered removal run during finalization

pub mod apply;
pub mod teardown;

pub use apply::{is_create_only, is_owner_exempt, Converger, FIELD_MANAGER};
pub use teardown::{TeardownAction, TeardownPlan, TeardownProgress, TeardownStep};

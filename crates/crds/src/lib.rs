//! Devbox CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the devbox controller.

pub mod devbox;
pub mod runtime;
mod schema;

pub use devbox::*;
pub use runtime::*;

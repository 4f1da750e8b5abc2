//! DVR Installer Library
//!
//! This library provides the privileged build pipeline:
//! - Credential broker (sudo session + escalation wrapper)
//! - Build staging and rollback
//! - Privileged command runner with a streaming log
//! - Post-install package pinning
//! - Flow controller sequencing the above

// Re-export from dvr-common for convenience
pub use dvr_common::{config, paths, request};

pub mod credentials;
pub mod flow;
pub mod registrar;
pub mod runner;
pub mod stager;

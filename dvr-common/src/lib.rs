//! DVR Installer Common Library
//!
//! Shared modules for the installer pipeline and its front-ends.
//! This crate has NO async dependencies.

pub mod config;
pub mod paths;
pub mod request;

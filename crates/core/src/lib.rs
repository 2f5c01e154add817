//! Core functionality for the SecureMesh peer node.
//!
//! This crate provides the configuration model, logging initialisation and
//! the shared error type used across the SecureMesh workspace.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, NodeSection, SecuritySection, TransportSection};
pub use error::{CoreError, CoreResult};

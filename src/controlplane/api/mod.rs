//! API Module
//!
//! Provides the REST API for storage registration and sync, and the
//! metrics and health probe server.

pub mod probes;
pub mod rest;
pub mod server;

pub use probes::{run_probe_server, ProbeState};
pub use rest::RestRouter;
pub use server::*;

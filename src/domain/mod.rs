//! Domain layer - Core records and port definitions
//!
//! This module defines the records the orchestrators work on and the traits
//! (ports) that adapters implement, following hexagonal architecture
//! principles.

pub mod cipher;
pub mod models;
pub mod ports;

pub use cipher::*;
pub use models::*;
pub use ports::*;

//! Record Store Adapters
//!
//! Implementations of the store ports in [`crate::domain::ports`].

pub mod memory;

pub use memory::MemoryDatabase;

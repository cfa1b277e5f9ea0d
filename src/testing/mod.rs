//! Test doubles for the bus
//!
//! Provides an in-process [`MemoryBus`] implementation of
//! [`crate::bus::MessageBus`] to enable comprehensive testing without a
//! broker.

mod memory;

pub use memory::MemoryBus;

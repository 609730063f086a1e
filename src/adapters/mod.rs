//! Concrete [`crate::Adapter`] implementations.

pub mod memory;

#[cfg(feature = "websocket")]
pub mod websocket;

//! Sidetalk Types - Pure type definitions for the secure chat core
//!
//! This crate contains only serde data types with no async runtime
//! dependencies: the JSON wire frames, the plaintext message payload, and
//! the raw key material aliases shared by the crypto and client crates.

pub mod frame;
pub mod keys;
pub mod payload;

pub use frame::*;
pub use keys::*;
pub use payload::*;

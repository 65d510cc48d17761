//! Forge Core
//!
//! Core types shared by the Forge worker.
//!
//! This crate contains:
//! - Return codes: the integer taxonomy reported back to callers
//! - Domain types: decoded task descriptors and reply payloads
//! - Decoder: turns raw queue commands into typed task descriptors

pub mod codes;
pub mod decoder;
pub mod domain;
pub mod error;

pub use decoder::{Decoder, DecoderSettings, SHARED_DATA_PLACEHOLDER};
pub use error::DecodeError;

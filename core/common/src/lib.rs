//! Common utilities and types shared across fieldsync crates.
//!
//! This module provides the error taxonomy and the identifier types that
//! the codec, store, storage and sync crates agree on.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{InstanceId, SecretKey, TransmissionId};

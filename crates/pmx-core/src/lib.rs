//! # pmx-core
//!
//! Shared foundation for the pmxstat estimation crates: the common error type
//! and result alias. Estimation crates depend on this instead of defining
//! their own error enums so failures compose across crate boundaries.

pub mod error;

pub use error::{Error, Result};

//! Error types shared by the pmxstat crates.
//!
//! Estimation configurations are dense bundles of matrices and index vectors,
//! so the most common failures get structured variants of their own: a matrix
//! with the wrong dimensions, a vector with the wrong length, and an index
//! pointing outside the container it addresses. Everything else falls into a
//! configuration or numerics bucket.

use thiserror::Error;

/// Shared error type for configuration and estimation failures.
#[derive(Error, Debug)]
pub enum Error {
    /// A matrix-shaped configuration entity has the wrong dimensions.
    #[error("{name}: expected {want_rows}x{want_cols}, got {got_rows}x{got_cols}")]
    Shape {
        name: &'static str,
        got_rows: usize,
        got_cols: usize,
        want_rows: usize,
        want_cols: usize,
    },

    /// A vector-shaped configuration entity has the wrong length.
    #[error("{name}: expected length {want}, got {got}")]
    Length { name: &'static str, got: usize, want: usize },

    /// An index entry points outside the container it addresses.
    #[error("{name}: index {index} out of range ({limit})")]
    Index { name: &'static str, index: usize, limit: usize },

    /// Any other inadmissible configuration value: unknown tag, empty
    /// schedule, inconsistent layout.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Numerical failure during estimation, e.g. a covariance that lost
    /// positive definiteness or NaN in transformed data.
    #[error("numerical failure: {0}")]
    Numerics(String),

    /// I/O failure, e.g. while writing the chain dump.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

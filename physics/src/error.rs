//! Error types for broadphase and solver setup.

use crate::{body::BodyHandle, broadphase::ProxyHandle};
use glam::Vec3;
use thiserror::Error;

/// Errors reported at the API boundary before a step runs.
///
/// Degenerate geometry during a solve is not an error, the affected rows are skipped.
#[derive(Debug, Error)]
pub enum PhysicsError {
    /// The solver needs at least one iteration.
    #[error("solver iteration count must be at least 1, got {0}")]
    InvalidIterationCount(u32),

    /// Time steps must be finite and positive.
    #[error("invalid time step {0}")]
    InvalidTimeStep(f32),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A body handle does not refer to a body in the arena.
    #[error("unknown body {0:?}")]
    UnknownBody(BodyHandle),

    /// A proxy handle does not refer to a live proxy.
    #[error("unknown proxy {0:?}")]
    UnknownProxy(ProxyHandle),

    /// A proxy cannot pair with itself.
    #[error("proxy {0:?} cannot pair with itself")]
    SelfPair(ProxyHandle),

    /// Bounds with `mins > maxs` or non-finite corners.
    #[error("invalid bounds: mins {mins} maxs {maxs}")]
    InvalidBounds {
        /// Lower corner.
        mins: Vec3,
        /// Upper corner.
        maxs: Vec3,
    },

    /// The configured proxy limit was reached.
    #[error("proxy capacity of {0} exceeded")]
    ProxyCapacityExceeded(usize),

    /// The configured pair limit was reached.
    #[error("pair capacity of {0} exceeded")]
    PairCapacityExceeded(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for physics operations.
pub type PhysicsResult<T> = Result<T, PhysicsError>;

//! Custom error types for the capture core.
//!
//! This module defines the primary error type, `CaptureError`, shared by the
//! actors, the controller and the service layer. Using the `thiserror` crate,
//! it gives one consistent place for everything that can go wrong inside the
//! coordination core, from rejected job specifications to missed deadlines.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidJobSpec`**: a job specification failed validation at the queue
//!   boundary. The whole queue is rejected and the previous one kept.
//! - **`JobRecordTimeout`** / **`JobRecordUnavailable`**: the storage
//!   collaborator did not confirm a job-record id before the first capture
//!   deadline. The job aborts; this is never retried because retrying would
//!   shift the whole schedule.
//! - **`QueueNotSet`**: the controller started but no queue arrived within its
//!   startup window.
//! - **`ReadyTimeout`**: an actor did not report readiness in time.
//! - **`ActorFailed`**: a hook of an actor loop failed or panicked.
//! - **`Config`** / **`Configuration`**: configuration could not be loaded or
//!   is semantically invalid.
//!
//! Hardware and storage collaborators report their own failures through
//! `anyhow::Error`, which converts into `Collaborator`.

use thiserror::Error;

/// Convenience alias for results using the capture error type.
pub type AppResult<T> = std::result::Result<T, CaptureError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Invalid job spec at position {index}: {reason}")]
    InvalidJobSpec { index: usize, reason: String },

    #[error("No job-record id for experiment {xp_id} before the first capture deadline")]
    JobRecordTimeout { xp_id: i64 },

    #[error("Storage dropped the job-record request for experiment {xp_id}")]
    JobRecordUnavailable { xp_id: i64 },

    #[error("No job queue was set within {0:?} of controller startup")]
    QueueNotSet(std::time::Duration),

    #[error("Actor '{name}' was not ready within {timeout:?}")]
    ReadyTimeout {
        name: String,
        timeout: std::time::Duration,
    },

    #[error("Actor '{name}' failed: {reason}")]
    ActorFailed { name: String, reason: String },

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for CaptureError {
    fn from(value: figment::Error) -> Self {
        CaptureError::Config(Box::new(value))
    }
}

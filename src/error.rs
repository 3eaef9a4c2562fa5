use std::io;
use thiserror::Error;

/// Main error type for volume driver operations
#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("Invalid volume options: {0}")]
    Validation(String),

    #[error("Volume not found: {0}")]
    NotFound(String),

    #[error("Volume already exists: {0}")]
    AlreadyExists(String),

    #[error("Volume conflict: {0}")]
    Conflict(String),

    #[error("Mount failed: {0}")]
    MountExecution(String),

    #[error("Unmount verification failed: {0}")]
    UnmountVerification(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("State persistence error: {0}")]
    Persistence(String),
}

impl VolumeError {
    /// Whether the failure was caused by the caller's request rather than
    /// by the host (bad options, unknown name, busy volume)
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            VolumeError::Validation(_)
                | VolumeError::NotFound(_)
                | VolumeError::AlreadyExists(_)
                | VolumeError::Conflict(_)
        )
    }
}

/// Result type alias for volume driver operations
pub type Result<T> = std::result::Result<T, VolumeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_errors() {
        assert!(VolumeError::NotFound("a".into()).is_caller_error());
        assert!(VolumeError::Conflict("a".into()).is_caller_error());
        assert!(!VolumeError::MountExecution("boom".into()).is_caller_error());
        assert!(!VolumeError::Io(io::Error::other("disk")).is_caller_error());
    }

    #[test]
    fn test_io_error_converts() {
        let err: VolumeError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, VolumeError::Io(_)));
        assert!(err.to_string().contains("gone"));
    }
}

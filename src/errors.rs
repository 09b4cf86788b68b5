use std::path::PathBuf;

use thiserror::Error;

/// Structured error taxonomy for the session runtime.
///
/// Every variant carries a stable machine-readable code (see [`HubError::code`])
/// so API handlers can map failures without string matching.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("working directory does not exist: {path}")]
    InvalidWorkingDir { path: PathBuf },

    #[error("failed to spawn process: {reason}")]
    SpawnFailed { reason: String },

    #[error("session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("session {session_id} exists but its paths are invalid")]
    SessionPathsNotFound { session_id: String },

    #[error("failed to kill session {session_id}: {reason}")]
    KillFailed { session_id: String, reason: String },

    #[error("failed to resize session {session_id}: {reason}")]
    ResizeFailed { session_id: String, reason: String },

    #[error("failed to save session info: {source}")]
    SaveSessionFailed {
        #[source]
        source: std::io::Error,
    },

    #[error("failed to list sessions: {source}")]
    ListSessionsFailed {
        #[source]
        source: std::io::Error,
    },

    #[error("failed to clean up session {session_id}: {source}")]
    CleanupFailed {
        session_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no socket connection to session {session_id}")]
    NoSocketConnection { session_id: String },

    #[error("remote name {name} is already registered")]
    DuplicateRemoteName { name: String },
}

impl HubError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalidInput",
            Self::InvalidWorkingDir { .. } => "invalidWorkingDir",
            Self::SpawnFailed { .. } => "spawnFailed",
            Self::SessionNotFound { .. } => "sessionNotFound",
            Self::SessionPathsNotFound { .. } => "sessionPathsNotFound",
            Self::KillFailed { .. } => "killFailed",
            Self::ResizeFailed { .. } => "resizeFailed",
            Self::SaveSessionFailed { .. } => "saveSessionFailed",
            Self::ListSessionsFailed { .. } => "listSessionsFailed",
            Self::CleanupFailed { .. } => "cleanupFailed",
            Self::NoSocketConnection { .. } => "noSocketConnection",
            Self::DuplicateRemoteName { .. } => "duplicateRemoteName",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionNotFound { session_id }
            | Self::SessionPathsNotFound { session_id }
            | Self::KillFailed { session_id, .. }
            | Self::ResizeFailed { session_id, .. }
            | Self::CleanupFailed { session_id, .. }
            | Self::NoSocketConnection { session_id } => Some(session_id),
            _ => None,
        }
    }

    /// Maps a raw spawn-time OS error to a friendlier message.
    pub fn spawn_failed_from_io(program: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let reason = match err.kind() {
            ErrorKind::NotFound => format!("executable not found: {program}"),
            ErrorKind::PermissionDenied => format!("permission denied executing {program}"),
            _ => match err.raw_os_error() {
                Some(libc::ENXIO) => format!("terminal allocation failed for {program}"),
                Some(libc::ENOTDIR | libc::ENOENT) => {
                    format!("working directory or executable missing for {program}")
                }
                _ => format!("{program}: {err}"),
            },
        };
        Self::SpawnFailed { reason }
    }
}

pub type Result<T, E = HubError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let err = HubError::SessionNotFound {
            session_id: "abc".to_string(),
        };
        assert_eq!(err.code(), "sessionNotFound");
        assert_eq!(err.session_id(), Some("abc"));

        let err = HubError::DuplicateRemoteName {
            name: "r1".to_string(),
        };
        assert_eq!(err.code(), "duplicateRemoteName");
        assert_eq!(err.session_id(), None);
    }

    #[test]
    fn test_spawn_failed_friendly_messages() {
        let err = HubError::spawn_failed_from_io(
            "nosuch",
            &std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert_eq!(err.code(), "spawnFailed");
        assert!(err.to_string().contains("executable not found"));

        let err = HubError::spawn_failed_from_io(
            "locked",
            &std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(err.to_string().contains("permission denied"));
    }
}

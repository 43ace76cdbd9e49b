use crate::models::{MissionId, SessionId, SessionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Foreground,
    Background,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Permission::Foreground => f.write_str("foreground location"),
            Permission::Background => f.write_str("background location"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("{0} permission was not granted")]
    PermissionDenied(Permission),
    #[error("mission {mission_id} already has active session {session_id}")]
    AlreadyActive {
        mission_id: MissionId,
        session_id: SessionId,
    },
    #[error("no such session: {0}")]
    NotFound(SessionId),
    #[error("session {session_id} is {status}, not paused")]
    NotPaused {
        session_id: SessionId,
        status: SessionStatus,
    },
    #[error("session {session_id} cannot go from {from} to {to}")]
    InvalidTransition {
        session_id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("invalid sample: {0}")]
    InvalidSample(String),
    #[error("failed to persist sample: {0:#}")]
    IngestionWriteFailed(anyhow::Error),
    #[error("failed to load points for aggregation: {0:#}")]
    AggregationReadFailed(anyhow::Error),
    #[error("storage error: {0:#}")]
    Store(anyhow::Error),
}

pub type Result<T, E = TrackingError> = std::result::Result<T, E>;

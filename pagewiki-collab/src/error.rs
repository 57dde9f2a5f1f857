//! Error taxonomy for the collaboration core.
//!
//! Each concern owns its error enum; [`CollabError`] is what crosses module
//! boundaries and what gets reported to a session as an `error` frame.

use std::time::Duration;

use crate::engine::EngineError;
use crate::store::StoreError;

/// Socket-level failure or an oversized frame. Session-scoped.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("no heartbeat from peer within {0:?}")]
    IdleTimeout(Duration),
}

/// Invalid envelope or frame type. The session is closed immediately.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("binary frames are not accepted")]
    BinaryFrame,
}

#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Persistence(#[from] StoreError),

    #[error(transparent)]
    MergeEngine(#[from] EngineError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("edit capability required")]
    Forbidden,

    #[error("room manager has shut down")]
    ManagerClosed,
}

impl CollabError {
    /// Stable machine-readable kind, sent in `error` frames.
    pub fn kind(&self) -> &'static str {
        match self {
            CollabError::Connection(_) => "connection",
            CollabError::Persistence(_) => "persistence",
            CollabError::MergeEngine(_) => "merge_engine",
            CollabError::Protocol(_) => "protocol",
            CollabError::Forbidden => "forbidden",
            CollabError::ManagerClosed => "unavailable",
        }
    }

    /// Whether the session must be torn down after this error.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(
            self,
            CollabError::Connection(_) | CollabError::Protocol(_) | CollabError::ManagerClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_distinct_per_category() {
        let conn: CollabError = ConnectionError::Transport("reset".into()).into();
        let proto: CollabError = ProtocolError::BinaryFrame.into();
        let store: CollabError = StoreError::VersionConflict {
            page: "p".into(),
            expected: 2,
            got: 5,
        }
        .into();
        let engine: CollabError = EngineError::Timeout(Duration::from_secs(1)).into();

        assert_eq!(conn.kind(), "connection");
        assert_eq!(proto.kind(), "protocol");
        assert_eq!(store.kind(), "persistence");
        assert_eq!(engine.kind(), "merge_engine");
    }

    #[test]
    fn test_only_session_level_errors_are_fatal() {
        assert!(CollabError::from(ProtocolError::BinaryFrame).is_fatal_for_session());
        assert!(CollabError::from(ConnectionError::IdleTimeout(Duration::from_secs(60)))
            .is_fatal_for_session());
        assert!(!CollabError::Forbidden.is_fatal_for_session());
        assert!(
            !CollabError::from(EngineError::Timeout(Duration::from_secs(1))).is_fatal_for_session()
        );
    }
}

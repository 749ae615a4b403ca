//! Error type shared across the daemon's subsystems.

/// Errors that can occur inside groved.
///
/// Each variant corresponds to a subsystem: project/worktree management,
/// container runtime, PTY handling, instance snapshots, or the IPC layer.
/// Request handlers translate every variant into an `{ok:false, error}`
/// response; nothing here crosses the wire as a panic.
#[derive(Debug, thiserror::Error)]
pub enum GroveError {
    /// Project registration, in-repo config, or git worktree failure.
    #[error("{0}")]
    Project(String),

    /// Docker or docker-compose invocation failure.
    #[error("{0}")]
    Container(String),

    /// PTY allocation or agent spawn failure.
    #[error("pty: {0}")]
    Pty(String),

    /// Instance snapshot persistence failure.
    #[error("state store: {0}")]
    Store(String),

    /// Malformed or unserviceable client request.
    #[error("{0}")]
    Request(String),
}

pub type Result<T> = std::result::Result<T, GroveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_passes_message_through() {
        assert_eq!(
            GroveError::Project("project \"x\" not found".into()).to_string(),
            "project \"x\" not found"
        );
        assert_eq!(GroveError::Pty("openpty failed".into()).to_string(), "pty: openpty failed");
    }
}

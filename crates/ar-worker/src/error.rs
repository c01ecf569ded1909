// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Worker subsystem error taxonomy.

/// Result alias for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors surfaced by worker sessions and the session pool.
///
/// Most of these are a normal part of the protocol and are mapped to
/// user-visible reply text by the request orchestrator; only spawn and
/// I/O failures indicate something actually broke.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("session is dead")]
    SessionDead,

    #[error("session was released")]
    SessionReleased,

    #[error("session is processing another message")]
    SessionBusy,

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("session pool at capacity ({0} concurrent sessions)")]
    Capacity(usize),

    #[error("stdout buffer exceeded {0} bytes without a newline")]
    BufferOverflow(usize),

    #[error("failed to spawn worker: {0}")]
    SpawnFailed(std::io::Error),

    #[error("worker process exited")]
    ProcessExited,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkerError {
    /// True for errors that leave the session usable.
    pub fn session_survives(&self) -> bool {
        matches!(self, WorkerError::SessionBusy | WorkerError::Timeout(_))
    }
}

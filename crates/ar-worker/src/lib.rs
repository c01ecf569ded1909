// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Worker-CLI process management for agent-relay.
//!
//! A [`WorkerSession`] wraps one long-lived worker child process that
//! speaks newline-delimited JSON on stdin/stdout, exposing a strictly
//! serialized request/response operation over that pipe. The
//! [`SessionPool`] owns every live session, binds conversation contexts
//! to sessions, and enforces concurrency capacity.

pub mod content;
mod error;
pub mod pool;
pub mod process;
pub mod session;
pub mod wire;

pub use content::{ContentBlock, WorkerContent};
pub use error::{WorkerError, WorkerResult};
pub use pool::{PoolReply, SessionPool, SessionPoolOptions, SessionPidLookup};
pub use session::{SessionPhase, WorkerLaunchSpec, WorkerReply, WorkerSession};
pub use wire::TokenUsage;

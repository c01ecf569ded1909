// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! agent-relay A2A contract types and validation
//!
//! This crate defines the schema types for the A2A JSON-RPC/REST
//! surface. These types are shared between the server, tests, and any
//! Rust client implementation.

pub mod error;
pub mod jsonrpc;
pub mod types;
pub mod validation;

pub use error::*;
pub use jsonrpc::*;
pub use types::*;

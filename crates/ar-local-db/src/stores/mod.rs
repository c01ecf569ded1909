// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Store-per-table access layers.

pub mod budget;
pub mod revoked;
pub mod sessions;
pub mod tasks;

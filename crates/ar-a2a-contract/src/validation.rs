// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Request validation helpers.

use crate::types::{Message, Part, Role};
use thiserror::Error;

/// Validation failures for incoming messages.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message role must be 'user'")]
    NotUserRole,
    #[error("message has no content")]
    EmptyMessage,
}

/// Validate an incoming `message/send` message.
///
/// A message is empty when it has no parts, or when every part is a
/// text part that is blank after trimming. File and data parts always
/// count as content.
pub fn validate_incoming_message(message: &Message) -> Result<(), ValidationError> {
    if message.role != Role::User {
        return Err(ValidationError::NotUserRole);
    }

    let has_content = message.parts.iter().any(|part| match part {
        Part::Text { text } => !text.trim().is_empty(),
        Part::File { .. } | Part::Data { .. } => true,
    });

    if has_content {
        Ok(())
    } else {
        Err(ValidationError::EmptyMessage)
    }
}

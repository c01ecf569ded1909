// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Multimodal content sent to the worker.
//!
//! The worker accepts either a plain string (the backward-compatible
//! path used when every incoming part is text) or a sequence of typed
//! content blocks.

use serde::{Deserialize, Serialize};

/// Base64 payload with its media type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

impl BlockSource {
    fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self { source_type: "base64".into(), media_type: media_type.into(), data: data.into() }
    }
}

/// One typed block inside a multimodal message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: BlockSource },
    Document { source: BlockSource },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn image(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        ContentBlock::Image { source: BlockSource::base64(media_type, data) }
    }

    pub fn document(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        ContentBlock::Document { source: BlockSource::base64(media_type, data) }
    }
}

/// Payload of one user turn: a plain string or typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// The single NDJSON line written to the worker per user turn.
#[derive(Debug, Serialize)]
pub struct UserFrame<'a> {
    #[serde(rename = "type")]
    frame_type: &'static str,
    message: UserMessage<'a>,
}

#[derive(Debug, Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: &'a WorkerContent,
}

impl<'a> UserFrame<'a> {
    pub fn new(content: &'a WorkerContent) -> Self {
        Self { frame_type: "user", message: UserMessage { role: "user", content } }
    }

    /// Serialize to a complete line, newline included.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

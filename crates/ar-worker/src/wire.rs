// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Worker stream-JSON wire frames.
//!
//! The worker emits one JSON object per stdout line. Only two frame
//! types carry state the server acts on: the `system`/`init` handshake
//! and the `result` frame closing one turn. Everything else
//! (`assistant`, `user`, `rate_limit_event`, `stream_event`) is
//! ignored, and unknown fields inside known frames are ignored too —
//! the schema is parse-permissive by contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token accounting quadruple reported in a result frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// `{"type":"system","subtype":"init",...}` — emitted once the worker
/// has read its first stdin bytes.
#[derive(Debug, Clone, Deserialize)]
pub struct InitFrame {
    pub session_id: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// `{"type":"result",...}` — closes one request/response turn.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultFrame {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub duration_api_ms: u64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub permission_denials: Vec<Value>,
}

/// Dispatch result for one stdout line.
#[derive(Debug)]
pub enum WorkerFrame {
    Init(InitFrame),
    Result(ResultFrame),
    /// A known-but-unused or unknown frame type.
    Ignored,
    /// A `result`-typed line that failed schema decode. Logged and
    /// discarded; the pending send keeps waiting.
    Malformed(String),
}

/// Decode one NDJSON line. Returns `None` for lines that are not JSON
/// objects at all.
pub fn parse_line(line: &[u8]) -> Option<WorkerFrame> {
    let value: Value = serde_json::from_slice(line).ok()?;
    let frame_type = value.get("type").and_then(Value::as_str)?;

    match frame_type {
        "system" => {
            if value.get("subtype").and_then(Value::as_str) == Some("init") {
                match serde_json::from_value::<InitFrame>(value) {
                    Ok(init) => Some(WorkerFrame::Init(init)),
                    Err(e) => Some(WorkerFrame::Malformed(e.to_string())),
                }
            } else {
                Some(WorkerFrame::Ignored)
            }
        }
        "result" => match serde_json::from_value::<ResultFrame>(value) {
            Ok(result) => Some(WorkerFrame::Result(result)),
            Err(e) => Some(WorkerFrame::Malformed(e.to_string())),
        },
        _ => Some(WorkerFrame::Ignored),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_frame_parses_and_ignores_unknown_fields() {
        let line = br#"{"type":"system","subtype":"init","session_id":"abc","model":"opus",
                        "tools":["Bash"],"apiKeySource":"none"}"#;
        match parse_line(line) {
            Some(WorkerFrame::Init(init)) => {
                assert_eq!(init.session_id, "abc");
                assert_eq!(init.model.as_deref(), Some("opus"));
            }
            other => panic!("expected init frame, got {other:?}"),
        }
    }

    #[test]
    fn result_frame_parses_full_tuple() {
        let line = br#"{"type":"result","subtype":"success","is_error":false,
            "result":"4","session_id":"abc","duration_ms":1500,"duration_api_ms":900,
            "num_turns":1,"total_cost_usd":0.003,
            "usage":{"input_tokens":10,"output_tokens":5,
                     "cache_creation_input_tokens":0,"cache_read_input_tokens":2},
            "permission_denials":[]}"#;
        match parse_line(line) {
            Some(WorkerFrame::Result(result)) => {
                assert_eq!(result.result.as_deref(), Some("4"));
                assert!(!result.is_error);
                assert_eq!(result.usage.input_tokens, 10);
                assert_eq!(result.usage.cache_read_input_tokens, 2);
                assert_eq!(result.num_turns, 1);
            }
            other => panic!("expected result frame, got {other:?}"),
        }
    }

    #[test]
    fn intermediate_frames_are_ignored() {
        for line in [
            br#"{"type":"assistant","message":{}}"#.as_slice(),
            br#"{"type":"user","message":{}}"#.as_slice(),
            br#"{"type":"rate_limit_event"}"#.as_slice(),
            br#"{"type":"stream_event","event":{}}"#.as_slice(),
            br#"{"type":"system","subtype":"compact"}"#.as_slice(),
        ] {
            assert!(matches!(parse_line(line), Some(WorkerFrame::Ignored)));
        }
    }

    #[test]
    fn garbage_lines_return_none() {
        assert!(parse_line(b"not json at all").is_none());
        assert!(parse_line(b"42").is_none());
        assert!(parse_line(br#"{"no_type":true}"#).is_none());
    }

    #[test]
    fn malformed_result_is_flagged_not_dropped_silently() {
        // "usage" with the wrong shape fails schema decode.
        let line = br#"{"type":"result","usage":"not-an-object"}"#;
        assert!(matches!(parse_line(line), Some(WorkerFrame::Malformed(_))));
    }

    #[test]
    fn result_defaults_apply_for_sparse_frames() {
        let line = br#"{"type":"result","result":"ok","session_id":"s"}"#;
        match parse_line(line) {
            Some(WorkerFrame::Result(result)) => {
                assert_eq!(result.total_cost_usd, 0.0);
                assert_eq!(result.usage, TokenUsage::default());
                assert!(result.permission_denials.is_empty());
            }
            other => panic!("expected result frame, got {other:?}"),
        }
    }
}

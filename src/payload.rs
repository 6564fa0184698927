//! Data types flowing through the stage chain.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use std::fmt;

/// The value passed from one stage to the next.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// UTF-8 text (transcripts, model responses).
    Text(String),
    /// Raw audio bytes (PCM or encoded, stage-defined).
    Audio(Vec<u8>),
}

impl Payload {
    /// Returns the kind of this payload.
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Text(_) => PayloadKind::Text,
            Payload::Audio(_) => PayloadKind::Audio,
        }
    }
}

/// Declared input/output contract of a stage, checked once at chain
/// construction so a mismatched chain never serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Text,
    Audio,
    /// Compatible with anything. Used by entry stages that accept the raw
    /// wire input.
    Any,
}

impl PayloadKind {
    /// Whether a value of kind `produced` can feed a stage declaring `self`
    /// as its input.
    pub fn accepts(&self, produced: PayloadKind) -> bool {
        matches!(
            (self, produced),
            (PayloadKind::Any, _) | (_, PayloadKind::Any)
        ) || *self == produced
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Text => write!(f, "text"),
            PayloadKind::Audio => write!(f, "audio"),
            PayloadKind::Any => write!(f, "any"),
        }
    }
}

/// A client-visible item pushed into the output multiplexer.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Text(String),
    Audio(Vec<u8>),
    Error(String),
}

impl Chunk {
    /// Serializes the chunk to one line of the wire protocol:
    /// `{"type": "text"|"audio/wav"|"error", "chunk": ...}`.
    /// Binary chunks are base64-encoded.
    pub fn to_line(&self) -> String {
        let value = match self {
            Chunk::Text(text) => json!({"type": "text", "chunk": text}),
            Chunk::Audio(bytes) => {
                json!({"type": "audio/wav", "chunk": BASE64.encode(bytes)})
            }
            Chunk::Error(message) => json!({"type": "error", "chunk": message}),
        };
        let mut line = value.to_string();
        line.push('\n');
        line
    }
}

/// An item in a user's output queue: a chunk, or the terminal marker.
///
/// Exactly one `End` is delivered per logical request.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Chunk(Chunk),
    End,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_kind_matches_variant() {
        assert_eq!(Payload::Text("hi".to_string()).kind(), PayloadKind::Text);
        assert_eq!(Payload::Audio(vec![1, 2]).kind(), PayloadKind::Audio);
    }

    #[test]
    fn kind_accepts_same() {
        assert!(PayloadKind::Text.accepts(PayloadKind::Text));
        assert!(PayloadKind::Audio.accepts(PayloadKind::Audio));
    }

    #[test]
    fn kind_rejects_mismatch() {
        assert!(!PayloadKind::Text.accepts(PayloadKind::Audio));
        assert!(!PayloadKind::Audio.accepts(PayloadKind::Text));
    }

    #[test]
    fn kind_any_is_compatible_both_ways() {
        assert!(PayloadKind::Any.accepts(PayloadKind::Text));
        assert!(PayloadKind::Any.accepts(PayloadKind::Audio));
        assert!(PayloadKind::Text.accepts(PayloadKind::Any));
    }

    #[test]
    fn text_chunk_line_format() {
        let line = Chunk::Text("hello".to_string()).to_line();
        assert_eq!(line, "{\"chunk\":\"hello\",\"type\":\"text\"}\n");
    }

    #[test]
    fn error_chunk_line_format() {
        let line = Chunk::Error("backend down".to_string()).to_line();
        let parsed: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["type"], "error");
        assert_eq!(parsed["chunk"], "backend down");
    }

    #[test]
    fn audio_chunk_is_base64() {
        let line = Chunk::Audio(vec![0x00, 0xff, 0x10]).to_line();
        let parsed: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["type"], "audio/wav");
        let decoded = BASE64.decode(parsed["chunk"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, vec![0x00, 0xff, 0x10]);
    }

    #[test]
    fn every_line_ends_with_newline() {
        for chunk in [
            Chunk::Text("a".to_string()),
            Chunk::Audio(vec![1]),
            Chunk::Error("e".to_string()),
        ] {
            assert!(chunk.to_line().ends_with('\n'));
        }
    }
}

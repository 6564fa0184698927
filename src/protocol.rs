//! Wire protocol for the API surface: the request body accepted by
//! `POST /input` and its published JSON schema.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Body of a `POST /input` request.
///
/// Field names (`streamly`, `Input`, `Entry`) follow the established wire
/// protocol of the service's clients and are kept as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Whether the client wants incremental output from streaming-capable
    /// stages.
    #[serde(default)]
    pub streamly: bool,
    /// User identifier. One chain instance runs per user; a new request
    /// for the same user supersedes the previous one.
    pub user: String,
    /// Stage input. Interpretation is up to the entry stage's
    /// `handle_input` (e.g. plain text for an LLM entry, base64 audio for
    /// an ASR entry).
    #[serde(rename = "Input")]
    pub input: serde_json::Value,
    /// Index of the stage at which this request enters the chain.
    #[serde(rename = "Entry", default)]
    pub entry: usize,
}

impl ApiRequest {
    /// Deserialize a request from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// The JSON schema served on `GET /schema`.
    pub fn schema() -> serde_json::Value {
        json!({
            "title": "ApiRequest",
            "type": "object",
            "properties": {
                "streamly": {
                    "type": "boolean",
                    "default": false,
                    "description": "Request incremental output from streaming-capable stages"
                },
                "user": {
                    "type": "string",
                    "description": "User identifier; a new request supersedes the previous one"
                },
                "Input": {
                    "description": "Entry stage input (text, or base64 audio for ASR entry)"
                },
                "Entry": {
                    "type": "integer",
                    "default": 0,
                    "minimum": 0,
                    "description": "Index of the stage the request enters at"
                }
            },
            "required": ["user", "Input"]
        })
    }
}

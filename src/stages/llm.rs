//! Language model stage.
//!
//! Streams chat completions from the model backend. Reasoning models wrap
//! their deliberation in `<think>...</think>`; the accumulator splits that
//! from the answer so the client can render both, while downstream stages
//! receive only the final answer text. Strict overlap policy: a user's
//! in-flight completion is never silently replaced mid-request.

use crate::backend::{Backend, HttpBackend, lines, send_with_retry};
use crate::config::LlmConfig;
use crate::error::{Result, VoxpipeError};
use crate::payload::{Chunk, Payload, PayloadKind};
use crate::protocol::ApiRequest;
use crate::stage::{Stage, StageContext};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

pub struct LlmStage {
    backend: Arc<dyn Backend>,
    retries: u32,
    retry_delay: Duration,
    strip_think: bool,
}

impl LlmStage {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Ok(Self::with_backend(
            Arc::new(HttpBackend::new(&config.backend)?),
            config.backend.retries,
            config.backend.retry_delay(),
            config.strip_think,
        ))
    }

    /// Construction with an injected backend, used by tests.
    pub fn with_backend(
        backend: Arc<dyn Backend>,
        retries: u32,
        retry_delay: Duration,
        strip_think: bool,
    ) -> Self {
        Self {
            backend,
            retries,
            retry_delay,
            strip_think,
        }
    }
}

/// Incremental splitter for `<think>`-wrapped model output.
#[derive(Debug, Default)]
struct Answer {
    think: String,
    response: String,
    in_think: bool,
    done: bool,
}

impl Answer {
    /// Routes one streamed content fragment into the think or response
    /// accumulator, dropping the tag markers themselves.
    fn append(&mut self, content: &str) {
        let mut rest = content;
        while !rest.is_empty() {
            if self.in_think {
                if let Some(end) = rest.find(THINK_CLOSE) {
                    self.think.push_str(&rest[..end]);
                    self.in_think = false;
                    rest = &rest[end + THINK_CLOSE.len()..];
                } else {
                    self.think.push_str(rest);
                    return;
                }
            } else if let Some(start) = rest.find(THINK_OPEN) {
                self.response.push_str(&rest[..start]);
                self.in_think = true;
                rest = &rest[start + THINK_OPEN.len()..];
            } else {
                self.response.push_str(rest);
                return;
            }
        }
    }

    /// Client-visible incremental state, pre-formatted as one JSON text
    /// chunk so the client never has to parse tags itself.
    fn to_chunk(&self) -> Chunk {
        Chunk::Text(
            json!({
                "think": self.think,
                "response": self.response,
                "Is_End": self.done,
            })
            .to_string(),
        )
    }
}

#[async_trait]
impl Stage for LlmStage {
    fn name(&self) -> &'static str {
        "llm"
    }

    fn input_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }

    fn output_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }

    fn handle_input(&self, request: &ApiRequest) -> Result<Payload> {
        let text = match request.input.as_str() {
            Some(text) => text.to_string(),
            None => request.input.to_string(),
        };
        Ok(Payload::Text(text))
    }

    async fn process(&self, ctx: &StageContext, input: Payload) -> Result<()> {
        let Payload::Text(prompt) = input else {
            return Err(VoxpipeError::Other("llm expects text input".to_string()));
        };
        log::debug!(
            "llm: processing for {}: {:.40}...",
            ctx.user(),
            prompt.replace('\n', " ")
        );

        let body = json!({
            "user": ctx.user(),
            "messages": [{"role": "user", "content": prompt}],
            "stream": ctx.streaming(),
        });
        let stream =
            send_with_retry(self.backend.as_ref(), ctx.user(), body, self.retries, self.retry_delay)
                .await?;
        let mut frames = lines(stream);

        let mut answer = Answer::default();
        while let Some(frame) = frames.next().await {
            if ctx.cancelled() {
                return Ok(());
            }
            let frame = frame?;
            if frame.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value =
                serde_json::from_str(&frame).map_err(|e| VoxpipeError::Backend {
                    message: format!("unparseable completion frame: {}", e),
                })?;
            if let Some(content) = value["message"]["content"].as_str() {
                answer.append(content);
            }
            if value["done"].as_bool().unwrap_or(false) {
                answer.done = true;
            }
            if ctx.streaming() {
                ctx.emit(answer.to_chunk());
            }
            if answer.done {
                break;
            }
        }
        answer.done = true;
        if !ctx.streaming() {
            // Non-streaming clients get the accumulated answer once.
            ctx.emit(answer.to_chunk());
        }

        let forwarded = if self.strip_think {
            answer.response.trim().to_string()
        } else {
            format!("{}{}", answer.think, answer.response).trim().to_string()
        };
        if forwarded.is_empty() {
            log::info!("llm: empty response for {}", ctx.user());
            return Ok(());
        }
        ctx.forward(Payload::Text(forwarded)).await
    }

    async fn heartbeat(&self) -> bool {
        self.backend.alive().await
    }
}

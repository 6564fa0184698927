//! Speech synthesis stage.
//!
//! Cleans the model's markdown to speakable text, splits it into
//! sentences, and synthesizes each one in turn so audio starts streaming
//! before the whole response is rendered. Audio chunks go straight to the
//! client; as the last stage of the standard chain it forwards nothing.

use crate::backend::{Backend, HttpBackend, send_with_retry};
use crate::config::TtsConfig;
use crate::error::{Result, VoxpipeError};
use crate::payload::{Chunk, Payload, PayloadKind};
use crate::protocol::ApiRequest;
use crate::stage::{Stage, StageContext};
use crate::text::{clean_markdown, split_sentences};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub struct TtsStage {
    backend: Arc<dyn Backend>,
    retries: u32,
    retry_delay: Duration,
}

impl TtsStage {
    pub fn from_config(config: &TtsConfig) -> Result<Self> {
        Ok(Self::with_backend(
            Arc::new(HttpBackend::new(&config.backend)?),
            config.backend.retries,
            config.backend.retry_delay(),
        ))
    }

    /// Construction with an injected backend, used by tests.
    pub fn with_backend(backend: Arc<dyn Backend>, retries: u32, retry_delay: Duration) -> Self {
        Self {
            backend,
            retries,
            retry_delay,
        }
    }
}

#[async_trait]
impl Stage for TtsStage {
    fn name(&self) -> &'static str {
        "tts"
    }

    fn input_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }

    fn output_kind(&self) -> PayloadKind {
        PayloadKind::Audio
    }

    fn handle_input(&self, request: &ApiRequest) -> Result<Payload> {
        let text = request
            .input
            .as_str()
            .ok_or_else(|| VoxpipeError::InputRejected {
                stage: "tts".to_string(),
                message: "expected text to synthesize".to_string(),
            })?;
        Ok(Payload::Text(text.to_string()))
    }

    async fn process(&self, ctx: &StageContext, input: Payload) -> Result<()> {
        let Payload::Text(text) = input else {
            return Err(VoxpipeError::Other("tts expects text input".to_string()));
        };

        let speakable = clean_markdown(&text);
        if speakable.is_empty() {
            log::info!("tts: nothing speakable for {}", ctx.user());
            return Ok(());
        }

        for sentence in split_sentences(&speakable) {
            if ctx.cancelled() {
                return Ok(());
            }
            let body = json!({"user": ctx.user(), "text": sentence});
            let mut stream = send_with_retry(
                self.backend.as_ref(),
                ctx.user(),
                body,
                self.retries,
                self.retry_delay,
            )
            .await?;

            while let Some(audio) = stream.next().await {
                if ctx.cancelled() {
                    return Ok(());
                }
                let audio = audio?;
                if !audio.is_empty() {
                    ctx.emit(Chunk::Audio(audio.to_vec()));
                }
            }
        }
        Ok(())
    }

    async fn heartbeat(&self) -> bool {
        self.backend.alive().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::stage::context::test_support::{RecordingEmit, RecordingForward, context_with};

    fn stage_with(backend: MockBackend) -> TtsStage {
        TtsStage::with_backend(Arc::new(backend), 0, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn synthesizes_per_sentence() {
        let backend = Arc::new(MockBackend::new().with_lines(vec!["AUDIO".to_string()]));
        let stage = TtsStage::with_backend(backend.clone(), 0, Duration::from_millis(1));
        let emitter = Arc::new(RecordingEmit::default());
        let forwarder = Arc::new(RecordingForward::default());
        let ctx = context_with(emitter.clone(), forwarder.clone());

        stage
            .process(&ctx, Payload::Text("First one. Second one.".to_string()))
            .await
            .unwrap();

        // One backend call per sentence, audio emitted for each.
        assert_eq!(backend.call_count(), 2);
        let requests = backend.requests();
        assert_eq!(requests[0].1["text"], "First one.");
        assert_eq!(requests[1].1["text"], "Second one.");

        let chunks = emitter.chunks();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| matches!(c, Chunk::Audio(_))));
        // Last stage forwards nothing.
        assert!(forwarder.payloads().is_empty());
    }

    #[tokio::test]
    async fn sends_cleaned_text_to_backend() {
        let backend = Arc::new(MockBackend::new().with_lines(vec!["AUDIO".to_string()]));
        let stage = TtsStage::with_backend(backend.clone(), 0, Duration::from_millis(1));
        let emitter = Arc::new(RecordingEmit::default());
        let forwarder = Arc::new(RecordingForward::default());
        let ctx = context_with(emitter, forwarder);

        stage
            .process(&ctx, Payload::Text("**Bold** claim.".to_string()))
            .await
            .unwrap();

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1["text"], "Bold claim.");
    }

    #[tokio::test]
    async fn markdown_only_input_is_silent() {
        let backend = MockBackend::new().with_lines(vec!["AUDIO".to_string()]);
        let stage = stage_with(backend);
        let emitter = Arc::new(RecordingEmit::default());
        let forwarder = Arc::new(RecordingForward::default());
        let ctx = context_with(emitter.clone(), forwarder);

        stage
            .process(&ctx, Payload::Text("```\ncode only\n```".to_string()))
            .await
            .unwrap();
        assert!(emitter.chunks().is_empty());
    }

    #[tokio::test]
    async fn backend_failure_surfaces_as_error() {
        let backend = MockBackend::new().with_status_failure(502);
        let stage = stage_with(backend);
        let emitter = Arc::new(RecordingEmit::default());
        let forwarder = Arc::new(RecordingForward::default());
        let ctx = context_with(emitter, forwarder);

        let result = stage
            .process(&ctx, Payload::Text("Say this.".to_string()))
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn handle_input_requires_text() {
        let stage = stage_with(MockBackend::new());
        let request = ApiRequest {
            streamly: false,
            user: "u1".to_string(),
            input: serde_json::json!(["not", "text"]),
            entry: 2,
        };
        assert!(stage.handle_input(&request).is_err());
    }
}

//! Speech recognition stage.
//!
//! Sends base64 audio to the recognition backend and reads a stream of
//! interim transcripts. Interim text is client-visible only; downstream
//! stages receive the final transcript alone. A later utterance for the
//! same user supersedes an earlier partial one, so overlap policy is
//! [`OverlapPolicy::Supersede`].

use crate::backend::{Backend, HttpBackend, lines, send_with_retry};
use crate::config::AsrConfig;
use crate::error::{Result, VoxpipeError};
use crate::payload::{Chunk, Payload, PayloadKind};
use crate::protocol::ApiRequest;
use crate::stage::{OverlapPolicy, Stage, StageContext};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub struct AsrStage {
    backend: Arc<dyn Backend>,
    retries: u32,
    retry_delay: Duration,
}

impl AsrStage {
    pub fn from_config(config: &AsrConfig) -> Result<Self> {
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
impl Stage for AsrStage {
    fn name(&self) -> &'static str {
        "asr"
    }

    fn input_kind(&self) -> PayloadKind {
        PayloadKind::Audio
    }

    fn output_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }

    fn overlap(&self) -> OverlapPolicy {
        OverlapPolicy::Supersede
    }

    fn handle_input(&self, request: &ApiRequest) -> Result<Payload> {
        let encoded = request
            .input
            .as_str()
            .ok_or_else(|| VoxpipeError::InputRejected {
                stage: "asr".to_string(),
                message: "expected base64 audio as a string".to_string(),
            })?;
        let audio = BASE64
            .decode(encoded)
            .map_err(|e| VoxpipeError::InputRejected {
                stage: "asr".to_string(),
                message: format!("invalid base64 audio: {}", e),
            })?;
        Ok(Payload::Audio(audio))
    }

    async fn process(&self, ctx: &StageContext, input: Payload) -> Result<()> {
        let Payload::Audio(audio) = input else {
            return Err(VoxpipeError::Other("asr expects audio input".to_string()));
        };

        let body = json!({
            "user": ctx.user(),
            "audio": BASE64.encode(&audio),
            "streaming": ctx.streaming(),
        });
        let stream =
            send_with_retry(self.backend.as_ref(), ctx.user(), body, self.retries, self.retry_delay)
                .await?;
        let mut frames = lines(stream);

        let mut transcript = String::new();
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
                    message: format!("unparseable recognition frame: {}", e),
                })?;
            let text = value["text"].as_str().unwrap_or_default();
            if text.is_empty() {
                continue;
            }
            transcript = text.to_string();
            if value["is_final"].as_bool().unwrap_or(false) {
                break;
            }
            if ctx.streaming() {
                // Interim transcript: shown to the client, not forwarded.
                ctx.emit(Chunk::Text(json!({ "response": text }).to_string()));
            }
        }

        if transcript.is_empty() {
            log::info!("asr: no speech recognized for {}", ctx.user());
            return Ok(());
        }
        log::debug!("asr: final transcript for {}: {}", ctx.user(), transcript);
        ctx.forward(Payload::Text(transcript)).await
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
    use tokio_util::sync::CancellationToken;

    fn stage_with(backend: MockBackend) -> AsrStage {
        AsrStage::with_backend(Arc::new(backend), 0, Duration::from_millis(1))
    }

    fn request(input: serde_json::Value) -> ApiRequest {
        ApiRequest {
            streamly: false,
            user: "u1".to_string(),
            input,
            entry: 0,
        }
    }

    #[test]
    fn handle_input_decodes_base64() {
        let stage = stage_with(MockBackend::new());
        let encoded = BASE64.encode(b"RIFFdata");
        let payload = stage.handle_input(&request(json!(encoded))).unwrap();
        assert_eq!(payload, Payload::Audio(b"RIFFdata".to_vec()));
    }

    #[test]
    fn handle_input_rejects_bad_base64() {
        let stage = stage_with(MockBackend::new());
        assert!(stage.handle_input(&request(json!("not//valid!!"))).is_err());
        assert!(stage.handle_input(&request(json!(42))).is_err());
    }

    #[tokio::test]
    async fn forwards_final_transcript_only() {
        let backend = MockBackend::new().with_lines(vec![
            json!({"text": "turn", "is_final": false}).to_string(),
            json!({"text": "turn on the", "is_final": false}).to_string(),
            json!({"text": "turn on the lights", "is_final": true}).to_string(),
        ]);
        let stage = stage_with(backend);
        let emitter = Arc::new(RecordingEmit::default());
        let forwarder = Arc::new(RecordingForward::default());
        let ctx = context_with(emitter.clone(), forwarder.clone());

        stage.process(&ctx, Payload::Audio(vec![1, 2, 3])).await.unwrap();

        // Non-streaming: no interim chunks reach the client.
        assert!(emitter.chunks().is_empty());
        assert_eq!(
            forwarder.payloads(),
            vec![Payload::Text("turn on the lights".to_string())]
        );
    }

    #[tokio::test]
    async fn streaming_emits_interim_transcripts() {
        let backend = MockBackend::new().with_lines(vec![
            json!({"text": "hel", "is_final": false}).to_string(),
            json!({"text": "hello", "is_final": true}).to_string(),
        ]);
        let stage = stage_with(backend);
        let emitter = Arc::new(RecordingEmit::default());
        let forwarder = Arc::new(RecordingForward::default());
        let ctx = StageContext::new(
            true,
            "u1",
            0,
            CancellationToken::new(),
            emitter.clone(),
            forwarder.clone(),
        );

        stage.process(&ctx, Payload::Audio(vec![1])).await.unwrap();

        assert_eq!(
            emitter.chunks(),
            vec![Chunk::Text(json!({"response": "hel"}).to_string())]
        );
        assert_eq!(forwarder.payloads(), vec![Payload::Text("hello".to_string())]);
    }

    #[tokio::test]
    async fn empty_recognition_forwards_nothing() {
        let backend = MockBackend::new();
        let stage = stage_with(backend);
        let emitter = Arc::new(RecordingEmit::default());
        let forwarder = Arc::new(RecordingForward::default());
        let ctx = context_with(emitter, forwarder.clone());

        stage.process(&ctx, Payload::Audio(vec![1])).await.unwrap();
        assert!(forwarder.payloads().is_empty());
    }

    #[tokio::test]
    async fn backend_failure_surfaces_as_error() {
        let backend = MockBackend::new().with_status_failure(500);
        let stage = stage_with(backend);
        let emitter = Arc::new(RecordingEmit::default());
        let forwarder = Arc::new(RecordingForward::default());
        let ctx = context_with(emitter, forwarder);

        let result = stage.process(&ctx, Payload::Audio(vec![1])).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn heartbeat_reflects_backend() {
        let up = stage_with(MockBackend::new());
        assert!(up.heartbeat().await);
        let down = stage_with(MockBackend::new().with_down());
        assert!(!down.heartbeat().await);
    }
}

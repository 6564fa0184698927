//! Concrete pipeline stages: speech recognition, language model, speech
//! synthesis. Each is a thin wrapper over its [`Backend`] client; the
//! concurrency machinery lives in [`crate::stage`] and [`crate::chain`].
//!
//! [`Backend`]: crate::backend::Backend

pub mod asr;
pub mod llm;
pub mod tts;

pub use asr::AsrStage;
pub use llm::LlmStage;
pub use tts::TtsStage;

use crate::chain::{Chain, ChainBuilder};
use crate::config::Config;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// Assembles the standard ASR -> LLM -> TTS chain from configuration.
pub fn build_chain(config: &Config) -> Result<Chain> {
    ChainBuilder::new()
        .stage(
            Arc::new(AsrStage::from_config(&config.asr)?),
            Duration::from_secs(config.asr.max_duration_secs),
        )
        .stage(
            Arc::new(LlmStage::from_config(&config.llm)?),
            Duration::from_secs(config.llm.max_duration_secs),
        )
        .stage(
            Arc::new(TtsStage::from_config(&config.tts)?),
            Duration::from_secs(config.tts.max_duration_secs),
        )
        .idle_timeout(Duration::from_secs(config.server.stream_idle_timeout_secs))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_a_valid_chain() {
        let chain = build_chain(&Config::default()).unwrap();
        assert_eq!(
            chain.describe(),
            "asr(audio->text) -> llm(text->text) -> tts(text->audio)"
        );
    }
}

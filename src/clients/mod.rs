//! Narrow traits at the seam between the turn pipeline and the remote
//! inference providers (speech-to-text, chat completion, speech synthesis).
//!
//! Production code talks to [`http::HttpSttClient`], [`http::HttpLlmClient`],
//! and [`http::HttpTtsClient`]. Tests substitute in-memory fakes that
//! implement the same traits, so pipeline logic never depends on the
//! concrete HTTP shape.

pub mod fake;
pub mod http;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_stream::Stream;

use crate::error::Result;

/// One prior turn of conversation, used as LLM context.
#[derive(Debug, Clone)]
pub struct HistoryTurn {
    pub user: String,
    pub assistant: String,
}

/// Outcome of a transcription call.
#[derive(Debug, Clone)]
pub enum TranscribeOutcome {
    /// The audio was too small to bother sending to the provider.
    Skipped,
    /// A transcript was produced.
    Text { text: String, confidence: f32 },
}

/// Speech-to-text transcription.
#[async_trait]
pub trait SttClient: Send + Sync {
    /// Transcribe a buffer of compressed audio. `is_final` distinguishes a
    /// full-utterance call from a partial one for logging/metrics purposes
    /// only; the contract is identical either way.
    async fn transcribe(&self, audio: Bytes, is_final: bool) -> Result<TranscribeOutcome>;
}

/// One incremental event from an LLM token stream.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    /// A content delta.
    Token(String),
    /// Stream exhausted; carries the full accumulated text.
    Done { accumulated_text: String },
}

pub type LlmStream = Pin<Box<dyn Stream<Item = Result<LlmEvent>> + Send>>;

/// Chat completion with streaming.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Open a streamed completion. The returned stream is cancel-safe:
    /// dropping it before it's exhausted ends the underlying request.
    async fn generate_stream(
        &self,
        system_prompt: &str,
        history: &[HistoryTurn],
        user_text: &str,
    ) -> Result<LlmStream>;
}

pub type TtsStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Speech synthesis with chunked streaming.
#[async_trait]
pub trait TtsClient: Send + Sync {
    /// Synthesize `text` and stream back raw audio chunks in emission order.
    async fn synthesize_stream(&self, text: &str) -> Result<TtsStream>;
}

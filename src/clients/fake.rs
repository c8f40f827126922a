//! In-memory fakes for the inference client traits, used by controller and
//! bridge tests so they never touch the network.

use async_stream::stream;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Mutex;

use crate::error::Result;

use super::{HistoryTurn, LlmClient, LlmEvent, LlmStream, SttClient, TranscribeOutcome, TtsClient, TtsStream};

/// STT fake that returns a fixed transcript regardless of input, or replays
/// a scripted sequence of answers (one per call) if provided.
pub struct FakeSttClient {
    answers: Mutex<Vec<TranscribeOutcome>>,
    default_text: String,
}

impl FakeSttClient {
    pub fn always(text: impl Into<String>) -> Self {
        Self {
            answers: Mutex::new(Vec::new()),
            default_text: text.into(),
        }
    }

    pub fn scripted(answers: Vec<TranscribeOutcome>) -> Self {
        Self {
            answers: Mutex::new(answers),
            default_text: String::new(),
        }
    }
}

#[async_trait]
impl SttClient for FakeSttClient {
    async fn transcribe(&self, _audio: Bytes, _is_final: bool) -> Result<TranscribeOutcome> {
        let mut answers = self.answers.lock().unwrap();
        if !answers.is_empty() {
            return Ok(answers.remove(0));
        }
        Ok(TranscribeOutcome::Text {
            text: self.default_text.clone(),
            confidence: 1.0,
        })
    }
}

/// LLM fake that emits a fixed sequence of tokens then completes.
pub struct FakeLlmClient {
    tokens: Vec<String>,
}

impl FakeLlmClient {
    pub fn new(tokens: Vec<impl Into<String>>) -> Self {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    /// Convenience constructor that splits `full_text` into one-token chunks
    /// whose concatenation equals `full_text` exactly.
    pub fn from_text(full_text: &str) -> Self {
        Self {
            tokens: full_text
                .split_inclusive(' ')
                .map(|s| s.to_owned())
                .collect(),
        }
    }
}

#[async_trait]
impl LlmClient for FakeLlmClient {
    async fn generate_stream(
        &self,
        _system_prompt: &str,
        _history: &[HistoryTurn],
        _user_text: &str,
    ) -> Result<LlmStream> {
        let tokens = self.tokens.clone();
        let stream = stream! {
            let mut accumulated = String::new();
            for token in tokens {
                accumulated.push_str(&token);
                yield Ok(LlmEvent::Token(token));
            }
            yield Ok(LlmEvent::Done { accumulated_text: accumulated });
        };
        Ok(Box::pin(stream))
    }
}

/// TTS fake that returns one fixed chunk of silence-shaped bytes per call.
pub struct FakeTtsClient {
    chunk: Bytes,
}

impl FakeTtsClient {
    pub fn new(chunk_len: usize) -> Self {
        Self {
            chunk: Bytes::from(vec![0u8; chunk_len]),
        }
    }
}

#[async_trait]
impl TtsClient for FakeTtsClient {
    async fn synthesize_stream(&self, _text: &str) -> Result<TtsStream> {
        let chunk = self.chunk.clone();
        let stream = stream! {
            yield Ok(chunk);
        };
        Ok(Box::pin(stream))
    }
}

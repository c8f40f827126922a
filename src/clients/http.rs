//! HTTP implementations of the inference client traits.
//!
//! The LLM client speaks the OpenAI-compatible chat completions API and
//! consumes the response as Server-Sent Events. The STT and TTS clients
//! speak a generic multipart-upload / chunked-download contract. All three
//! share one keep-alive connection pool via a cloned [`reqwest::Client`].

use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::error::{CoreError, Result};

use super::{HistoryTurn, LlmClient, LlmEvent, LlmStream, SttClient, TranscribeOutcome, TtsClient, TtsStream};

/// Shared HTTP client plus resolved provider settings.
#[derive(Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    config: Arc<ProviderConfig>,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    fn base_url(&self, suffix: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), suffix)
    }

    /// Run `attempt` up to `max_retries + 1` times, backing off exponentially
    /// from `retry_base_delay` between tries, for errors the attempt reports
    /// as retryable.
    async fn with_retry<T, F, Fut>(&self, label: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut delay = self.config.retry_base_delay;
        let mut last_err = None;
        for try_number in 0..=self.config.max_retries {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && try_number < self.config.max_retries => {
                    // jitter of 0-10% of the delay avoids every connection's
                    // retries landing on the provider in lockstep.
                    let jitter = delay.mul_f64(rand::random::<f64>() * 0.1);
                    let wait = delay + jitter;
                    warn!("{label} attempt {try_number} failed, retrying in {wait:?}: {e}");
                    tokio::time::sleep(wait).await;
                    delay *= 2;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::ProviderPermanent(format!("{label}: exhausted retries"))))
    }
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> CoreError {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        CoreError::ProviderRetryable(format!("{status}: {body}"))
    } else {
        CoreError::ProviderPermanent(format!("{status}: {body}"))
    }
}

/// Non-streaming chat completion, used when an SSE stream closes without
/// ever producing a content delta.
async fn non_streaming_completion(provider: &HttpProvider, messages: &[serde_json::Value]) -> Result<String> {
    let body = serde_json::json!({
        "model": provider.config.llm_model,
        "messages": messages,
        "stream": false,
        "temperature": provider.config.llm_temperature,
        "max_tokens": provider.config.llm_max_tokens,
    });

    let resp = provider
        .client
        .post(provider.base_url("chat/completions"))
        .bearer_auth(&provider.config.api_key)
        .json(&body)
        .send()
        .await?;

    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(classify_status(status, &text));
    }

    let parsed: serde_json::Value = serde_json::from_str(&text)?;
    let content = parsed["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or_default()
        .to_owned();
    Ok(content)
}

/// STT client backed by a multipart upload returning JSON `{text, confidence}`.
pub struct HttpSttClient {
    provider: HttpProvider,
    min_audio_bytes: usize,
}

impl HttpSttClient {
    pub fn new(provider: HttpProvider, min_audio_bytes: usize) -> Self {
        Self {
            provider,
            min_audio_bytes,
        }
    }
}

#[async_trait]
impl SttClient for HttpSttClient {
    async fn transcribe(&self, audio: Bytes, is_final: bool) -> Result<TranscribeOutcome> {
        if audio.len() < self.min_audio_bytes {
            return Ok(TranscribeOutcome::Skipped);
        }

        let filename = format!("chunk-{}.webm", Uuid::new_v4());
        debug!(
            "transcribing {} bytes as {filename} (is_final={is_final})",
            audio.len()
        );

        self.provider
            .with_retry("stt", || {
                let provider = &self.provider;
                let audio = audio.clone();
                let filename = filename.clone();
                async move {
                    let part = reqwest::multipart::Part::bytes(audio.to_vec())
                        .file_name(filename)
                        .mime_str("audio/webm")
                        .map_err(|e| CoreError::ProviderPermanent(e.to_string()))?;
                    let form = reqwest::multipart::Form::new().part("file", part);

                    let resp = provider
                        .client
                        .post(provider.base_url("audio/transcriptions"))
                        .bearer_auth(&provider.config.api_key)
                        .multipart(form)
                        .send()
                        .await?;

                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if !status.is_success() {
                        return Err(classify_status(status, &body));
                    }

                    let parsed: serde_json::Value = serde_json::from_str(&body)?;
                    let text = parsed["text"].as_str().unwrap_or_default().to_owned();
                    let confidence = parsed["confidence"].as_f64().unwrap_or(1.0) as f32;
                    Ok(TranscribeOutcome::Text { text, confidence })
                }
            })
            .await
    }
}

/// LLM client speaking the OpenAI-compatible chat completions API over SSE.
pub struct HttpLlmClient {
    provider: HttpProvider,
}

impl HttpLlmClient {
    pub fn new(provider: HttpProvider) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate_stream(
        &self,
        system_prompt: &str,
        history: &[HistoryTurn],
        user_text: &str,
    ) -> Result<LlmStream> {
        let mut messages = vec![serde_json::json!({"role": "system", "content": system_prompt})];
        for turn in history {
            messages.push(serde_json::json!({"role": "user", "content": turn.user}));
            messages.push(serde_json::json!({"role": "assistant", "content": turn.assistant}));
        }
        messages.push(serde_json::json!({"role": "user", "content": user_text}));

        let body = serde_json::json!({
            "model": self.provider.config.llm_model,
            "messages": messages,
            "stream": true,
            "temperature": self.provider.config.llm_temperature,
            "max_tokens": self.provider.config.llm_max_tokens,
        });

        let resp = self
            .provider
            .client
            .post(self.provider.base_url("chat/completions"))
            .bearer_auth(&self.provider.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        info!("LLM stream opened (model={})", self.provider.config.llm_model);

        let provider = self.provider.clone();
        let mut byte_stream = resp.bytes_stream();
        let stream = try_stream! {
            let mut buf = BytesMut::new();
            let mut accumulated = String::new();

            'outer: while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk?;
                buf.extend_from_slice(&chunk);

                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line = buf.split_to(pos + 1);
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();

                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    if data == "[DONE]" {
                        break 'outer;
                    }

                    let parsed: serde_json::Value = match serde_json::from_str(data) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };

                    if let Some(content) = parsed["choices"][0]["delta"]["content"].as_str()
                        && !content.is_empty()
                    {
                        accumulated.push_str(content);
                        yield LlmEvent::Token(content.to_owned());
                    }

                    if parsed["choices"][0]["finish_reason"].as_str().is_some() {
                        break 'outer;
                    }
                }
            }

            // A stream that closes without a single content delta means the
            // provider didn't stream this response; retry it non-streaming
            // rather than surfacing an empty reply.
            if accumulated.is_empty() {
                warn!("LLM stream produced no tokens, falling back to non-streaming completion");
                accumulated = non_streaming_completion(&provider, &messages).await?;
                if !accumulated.is_empty() {
                    yield LlmEvent::Token(accumulated.clone());
                }
            }

            yield LlmEvent::Done { accumulated_text: accumulated };
        };

        Ok(Box::pin(stream))
    }
}

/// TTS client backed by a POST returning a chunked audio byte stream.
pub struct HttpTtsClient {
    provider: HttpProvider,
}

impl HttpTtsClient {
    pub fn new(provider: HttpProvider) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl TtsClient for HttpTtsClient {
    async fn synthesize_stream(&self, text: &str) -> Result<TtsStream> {
        let body = serde_json::json!({
            "model": "tts-1",
            "voice": self.provider.config.tts_voice,
            "speed": self.provider.config.tts_speed,
            "input": text,
            "response_format": "pcm",
        });

        debug!("synthesizing {} chars", text.len());

        let resp = self
            .provider
            .client
            .post(self.provider.base_url("audio/speech"))
            .bearer_auth(&self.provider.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let mut byte_stream = resp.bytes_stream();
        let stream = try_stream! {
            while let Some(chunk) = byte_stream.next().await {
                yield chunk?;
            }
        };

        Ok(Box::pin(stream))
    }
}

/// How long the keep-warm pinger waits before giving up on a single ping.
pub const KEEP_WARM_TIMEOUT: Duration = Duration::from_secs(5);

//! Orchestrates one turn: drives the LLM token stream, fires TTS on the
//! first complete spoken sentence while the LLM keeps generating, resolves
//! the structured reply, and streams the remainder.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clients::{HistoryTurn, LlmClient, LlmEvent, TtsClient};
use crate::envelope::{first_spoken_sentence, Intent, ReplyEnvelope};
use crate::error::{CoreError, Result};
use crate::opener_cache::OpenerCache;
use crate::scope::Product;
use crate::wire::{OutboundFrame, ServerEvent};

const TTS_CHUNK_SIZE: usize = 4096;

pub const SYSTEM_PROMPT_TEMPLATE: &str = "You are a restaurant ordering assistant. \
Always reply with a single JSON object matching this schema: \
{\"spoken_response\": string, \"intent\": \"hi\"|\"add\"|\"info\"|\"recommend\"|\"error\", \
\"product_name\": string|null, \"product_id\": integer|null, \"quantity\": integer, \
\"recommendation\": {\"product_id\": integer, \"product_name\": string, \"reason\": string}|null}. \
Begin spoken_response with one of these openers whenever it fits naturally: \
Of course, I'll add that to your cart. / Sure, coming right up. / Great choice! / \
Let me check that for you. / Absolutely, I can help with that. / Got it. / \
Here's what I'd recommend. / No problem at all.";

/// The result of a completed (non-cancelled) turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub envelope: ReplyEnvelope,
}

/// Drive one full turn of generation and synthesis.
///
/// Honors `token` at every suspension point: between LLM deltas, between
/// TTS chunks, and around the JSON parse. On cancellation no further
/// events are emitted and the cancellation error is returned.
#[allow(clippy::too_many_arguments)]
pub async fn run_turn(
    token: CancellationToken,
    llm: Arc<dyn LlmClient>,
    tts: Arc<dyn TtsClient>,
    opener_cache: Arc<OpenerCache>,
    menu_context: &str,
    products: &[Product],
    history: &[HistoryTurn],
    transcript: &str,
    out: mpsc::Sender<OutboundFrame>,
) -> Result<TurnOutcome> {
    send(&out, ServerEvent::Status { message: "thinking".into() }).await?;

    let system_prompt = format!("{SYSTEM_PROMPT_TEMPLATE}\n\n{menu_context}");
    let mut stream = llm.generate_stream(&system_prompt, history, transcript).await?;

    let mut accumulated = String::new();
    let mut tts_task: Option<(tokio::task::JoinHandle<Result<()>>, usize)> = None;
    let final_text;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                if let Some((handle, _)) = tts_task {
                    handle.abort();
                }
                return Err(CoreError::Cancelled);
            }
            item = stream.next() => {
                match item {
                    Some(Ok(LlmEvent::Token(delta))) => {
                        accumulated.push_str(&delta);
                        send(&out, ServerEvent::AiToken {
                            token: delta,
                            full_text: accumulated.clone(),
                        }).await?;

                        if tts_task.is_none()
                            && let Some(sentence) = first_spoken_sentence(&accumulated)
                        {
                            send(&out, ServerEvent::TtsStart).await?;
                            let consumed = sentence.len();
                            let handle = spawn_sentence_tts(
                                token.clone(),
                                Arc::clone(&tts),
                                Arc::clone(&opener_cache),
                                sentence,
                                out.clone(),
                            );
                            tts_task = Some((handle, consumed));
                        }
                    }
                    Some(Ok(LlmEvent::Done { accumulated_text })) => {
                        final_text = accumulated_text;
                        break;
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        final_text = accumulated.clone();
                        break;
                    }
                }
            }
        }
    }

    let envelope = ReplyEnvelope::parse_or_fallback(&final_text);
    send(&out, ServerEvent::AiComplete { data: envelope.clone() }).await?;

    if envelope.intent == Intent::Recommend
        && let Some(rec) = &envelope.recommendation
    {
        match products.iter().find(|p| p.id == rec.product_id) {
            Some(product) => {
                send(&out, ServerEvent::Recommendation { product: product.clone() }).await?;
            }
            None => warn!("{}", CoreError::RecommendationUnresolved(rec.product_id)),
        }
    }

    let already_synthesized = match tts_task.take() {
        Some((handle, consumed)) => {
            tokio::select! {
                _ = token.cancelled() => return Err(CoreError::Cancelled),
                result = handle => {
                    result.map_err(|e| CoreError::Channel(e.to_string()))??;
                }
            }
            consumed
        }
        None => {
            send(&out, ServerEvent::TtsStart).await?;
            0
        }
    };

    let remainder = envelope.spoken_response.get(already_synthesized..).unwrap_or("");
    if !remainder.trim().is_empty() {
        synthesize_and_forward(&token, &tts, &opener_cache, remainder, &out).await?;
    }

    send(&out, ServerEvent::TtsComplete).await?;

    info!("turn complete: intent={:?}", envelope.intent);
    Ok(TurnOutcome { envelope })
}

fn spawn_sentence_tts(
    token: CancellationToken,
    tts: Arc<dyn TtsClient>,
    opener_cache: Arc<OpenerCache>,
    sentence: String,
    out: mpsc::Sender<OutboundFrame>,
) -> tokio::task::JoinHandle<Result<()>> {
    tokio::spawn(async move {
        synthesize_and_forward(&token, &tts, &opener_cache, &sentence, &out).await
    })
}

/// Synthesize `text`, consulting the opener cache first: a cached prefix is
/// emitted immediately and only the remainder is sent to the TTS provider.
async fn synthesize_and_forward(
    token: &CancellationToken,
    tts: &Arc<dyn TtsClient>,
    opener_cache: &Arc<OpenerCache>,
    text: &str,
    out: &mpsc::Sender<OutboundFrame>,
) -> Result<()> {
    let remainder = if let Some((cached_audio, remainder)) = opener_cache.match_prefix(text) {
        forward_chunked(token, &cached_audio, out).await?;
        remainder
    } else {
        text
    };

    if remainder.trim().is_empty() {
        return Ok(());
    }

    let mut stream = tts.synthesize_stream(remainder).await?;
    loop {
        tokio::select! {
            _ = token.cancelled() => return Err(CoreError::Cancelled),
            chunk = stream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        out.send(OutboundFrame::Audio(bytes))
                            .await
                            .map_err(|e| CoreError::ClientGone(e.to_string()))?;
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                }
            }
        }
    }
}

async fn forward_chunked(
    token: &CancellationToken,
    audio: &Bytes,
    out: &mpsc::Sender<OutboundFrame>,
) -> Result<()> {
    for chunk in audio.chunks(TTS_CHUNK_SIZE) {
        if token.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        out.send(OutboundFrame::Audio(Bytes::copy_from_slice(chunk)))
            .await
            .map_err(|e| CoreError::ClientGone(e.to_string()))?;
    }
    Ok(())
}

async fn send(out: &mpsc::Sender<OutboundFrame>, event: ServerEvent) -> Result<()> {
    out.send(OutboundFrame::Event(event))
        .await
        .map_err(|e| CoreError::ClientGone(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::fake::{FakeLlmClient, FakeTtsClient};

    #[tokio::test]
    async fn happy_path_emits_expected_event_sequence() {
        let llm = Arc::new(FakeLlmClient::from_text(
            r#"{"spoken_response":"Of course, I'll add that to your cart.","intent":"add","product_name":"Kunefe","product_id":14,"quantity":1,"recommendation":null}"#,
        ));
        let tts: Arc<dyn TtsClient> = Arc::new(FakeTtsClient::new(8));
        let opener_cache = Arc::new(OpenerCache::empty());
        let (tx, mut rx) = mpsc::channel(64);
        let token = CancellationToken::new();

        let outcome = run_turn(
            token,
            llm,
            tts,
            opener_cache,
            "Menu: ...",
            &[],
            &[],
            "add a kunefe",
            tx,
        )
        .await
        .unwrap();

        assert_eq!(outcome.envelope.product_id, Some(14));

        let mut saw_ai_complete = false;
        let mut saw_tts_start = false;
        let mut saw_tts_complete = false;
        while let Some(frame) = rx.recv().await {
            match frame {
                OutboundFrame::Event(ServerEvent::AiComplete { .. }) => saw_ai_complete = true,
                OutboundFrame::Event(ServerEvent::TtsStart) => saw_tts_start = true,
                OutboundFrame::Event(ServerEvent::TtsComplete) => saw_tts_complete = true,
                _ => {}
            }
        }
        assert!(saw_ai_complete && saw_tts_start && saw_tts_complete);
    }

    #[tokio::test]
    async fn cancellation_stops_the_turn_before_completion() {
        let llm = Arc::new(FakeLlmClient::new(vec![
            "{\"spoken_response\":\"",
            "Hello there, ",
            "welcome in. ",
            "\",\"intent\":\"hi\"}",
        ]));
        let tts: Arc<dyn TtsClient> = Arc::new(FakeTtsClient::new(8));
        let opener_cache = Arc::new(OpenerCache::empty());
        let (tx, _rx) = mpsc::channel(64);
        let token = CancellationToken::new();
        token.cancel();

        let result = run_turn(token, llm, tts, opener_cache, "", &[], &[], "hi", tx).await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }

    #[tokio::test]
    async fn unresolved_recommendation_suppresses_recommendation_event() {
        let llm = Arc::new(FakeLlmClient::from_text(
            r#"{"spoken_response":"Here's what I'd recommend.","intent":"recommend","recommendation":{"product_id":99,"product_name":"Ghost","reason":"it's popular"}}"#,
        ));
        let tts: Arc<dyn TtsClient> = Arc::new(FakeTtsClient::new(8));
        let opener_cache = Arc::new(OpenerCache::empty());
        let (tx, mut rx) = mpsc::channel(64);
        let token = CancellationToken::new();

        run_turn(token, llm, tts, opener_cache, "", &[], &[], "what do you recommend", tx)
            .await
            .unwrap();

        let mut saw_recommendation = false;
        while let Some(frame) = rx.recv().await {
            if let OutboundFrame::Event(ServerEvent::Recommendation { .. }) = frame {
                saw_recommendation = true;
            }
        }
        assert!(!saw_recommendation);
    }
}

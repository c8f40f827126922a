//! The per-connection turn controller: the state machine that decides when
//! to run partial transcription, launches speculative turns on
//! end-of-utterance, reconciles them against the final transcript, and
//! handles barge-in.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::{run_turn, TurnOutcome};
use crate::error::{CoreError, Result as CoreResult};
use crate::clients::{HistoryTurn, TranscribeOutcome};
use crate::merger::{merge, overlap_ratio};
use crate::scope::Scope;
use crate::server::AppState;
use crate::session::{SessionState, VoiceSession};
use crate::wire::{ClientMessage, OutboundFrame, ServerEvent};

const MIN_WORDS_FOR_SPECULATION: usize = 3;

/// Drive one connection end to end: greeting, read loop, and teardown.
pub async fn handle_connection(state: Arc<AppState>, scope: Scope, socket: WebSocket) {
    let mut session = VoiceSession::new(scope, &state.turn_config);
    info!(session_id = %session.session_id, "connection opened");
    state.sessions_opened();

    let (ws_sink, ws_stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<OutboundFrame>(64);
    let writer = tokio::spawn(run_writer(ws_sink, out_rx));

    let _ = out_tx
        .send(OutboundFrame::Event(ServerEvent::Greeting {
            text: "Welcome! What can I get started for you today?".into(),
        }))
        .await;

    run_reader(&state, &mut session, ws_stream, out_tx).await;

    session.connection_token.cancel();
    writer.abort();
    state.sessions_closed();
    info!(
        session_id = %session.session_id,
        connected_at = %session.connected_at,
        duration_ms = session.start_time.elapsed().as_millis(),
        "connection closed"
    );
}

async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundFrame>,
) {
    while let Some(frame) = rx.recv().await {
        let message = match frame {
            OutboundFrame::Event(event) => match serde_json::to_string(&event) {
                Ok(text) => Message::Text(text.into()),
                Err(e) => {
                    warn!("failed to serialize outbound event: {e}");
                    continue;
                }
            },
            OutboundFrame::Audio(bytes) => Message::Binary(bytes),
        };
        if sink.send(message).await.is_err() {
            break;
        }
    }
}

async fn run_reader(
    state: &Arc<AppState>,
    session: &mut VoiceSession,
    mut ws_stream: SplitStream<WebSocket>,
    out_tx: mpsc::Sender<OutboundFrame>,
) {
    let mut partial_rx: Option<mpsc::Receiver<CoreResult<TranscribeOutcome>>> = None;
    let mut resolution: Option<tokio::task::JoinHandle<(CoreResult<TurnOutcome>, String)>> = None;

    loop {
        tokio::select! {
            biased;

            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        on_audio_frame(state, session, &bytes, &mut partial_rx).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Ping) => {
                                let _ = out_tx.send(OutboundFrame::Event(ServerEvent::Pong)).await;
                            }
                            Ok(ClientMessage::AudioEnd) => {
                                on_audio_end(state, session, &out_tx, &mut resolution).await;
                            }
                            Ok(ClientMessage::Interrupt) => {
                                on_interrupt(session, &out_tx, &mut partial_rx, &mut resolution).await;
                            }
                            Ok(ClientMessage::PlaybackComplete) => {}
                            Err(e) => warn!("unrecognized client message: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("websocket read error: {e}");
                        break;
                    }
                }
            }

            Some(result) = async {
                match partial_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                apply_partial_stt_result(session, result, &out_tx).await;
                partial_rx = None;
            }

            result = async {
                match resolution.as_mut() {
                    Some(handle) => handle.await,
                    None => std::future::pending().await,
                }
            }, if resolution.is_some() => {
                resolution = None;
                match result {
                    Ok((Ok(outcome), transcript)) => {
                        session.push_history(transcript, outcome.envelope.spoken_response.clone());
                    }
                    Ok((Err(CoreError::Cancelled), _)) => {}
                    Ok((Err(e), _)) => {
                        warn!("turn failed: {e}");
                        let _ = out_tx.send(OutboundFrame::Event(ServerEvent::Error {
                            message: e.to_string(),
                        })).await;
                    }
                    Err(e) => warn!("turn task panicked: {e}"),
                }
                session.finish_turn();
                session.reset_for_new_input();
            }
        }
    }
}

async fn on_audio_frame(
    state: &Arc<AppState>,
    session: &mut VoiceSession,
    frame: &Bytes,
    partial_rx: &mut Option<mpsc::Receiver<CoreResult<TranscribeOutcome>>>,
) {
    session.push_audio(frame);
    session.state = SessionState::Listening;

    if partial_rx.is_none() && session.can_process_partial_stt(&state.turn_config) {
        let token = session.begin_partial_stt();
        let audio = session.audio_snapshot();
        let stt = Arc::clone(&state.stt);
        let (tx, rx) = mpsc::channel(1);
        *partial_rx = Some(rx);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => Err(CoreError::Cancelled),
                result = stt.transcribe(audio, false) => result,
            };
            let _ = tx.send(result).await;
        });
    }
}

async fn apply_partial_stt_result(
    session: &mut VoiceSession,
    result: CoreResult<TranscribeOutcome>,
    out_tx: &mpsc::Sender<OutboundFrame>,
) {
    session.finish_partial_stt();
    match result {
        Ok(TranscribeOutcome::Text { text, confidence }) if !text.trim().is_empty() => {
            session.partial_transcript = merge(&session.partial_transcript, &text);
            let _ = out_tx
                .send(OutboundFrame::Event(ServerEvent::PartialTranscript {
                    text: session.partial_transcript.clone(),
                    confidence,
                    is_final: false,
                }))
                .await;
        }
        Ok(_) => {}
        Err(CoreError::Cancelled) => {}
        Err(e) => warn!("partial STT failed (ignored): {e}"),
    }
}

async fn on_audio_end(
    state: &Arc<AppState>,
    session: &mut VoiceSession,
    out_tx: &mpsc::Sender<OutboundFrame>,
    resolution: &mut Option<tokio::task::JoinHandle<(CoreResult<TurnOutcome>, String)>>,
) {
    if resolution.is_some() {
        return;
    }
    if let Some(token) = session.partial_stt_token.take() {
        token.cancel();
    }

    session.state = SessionState::ProcessingStt;
    let resolution_token = session.begin_turn();
    let partial_text = session.partial_transcript.clone();
    let audio = session.audio_snapshot();
    let history = session.history();
    let menu_context = session.scope.menu_context.clone();
    let products = session.scope.products.clone();

    let state = Arc::clone(state);
    let out_tx = out_tx.clone();

    let handle = tokio::spawn(async move {
        resolve_audio_end(
            state,
            resolution_token,
            partial_text,
            audio,
            history,
            menu_context,
            products,
            out_tx,
        )
        .await
    });
    *resolution = Some(handle);
}

#[allow(clippy::too_many_arguments)]
async fn resolve_audio_end(
    state: Arc<AppState>,
    token: CancellationToken,
    partial_text: String,
    audio: Bytes,
    history: Vec<HistoryTurn>,
    menu_context: String,
    products: Vec<crate::scope::Product>,
    out_tx: mpsc::Sender<OutboundFrame>,
) -> (CoreResult<TurnOutcome>, String) {
    let speculative = if partial_text.split_whitespace().count() >= MIN_WORDS_FOR_SPECULATION {
        let spec_token = token.child_token();
        let spec_transcript = partial_text.clone();
        let spec_transcript_for_task = spec_transcript.clone();
        let state = Arc::clone(&state);
        let menu_context = menu_context.clone();
        let products = products.clone();
        let history = history.clone();
        let out_tx = out_tx.clone();
        Some((
            tokio::spawn(async move {
                run_turn(
                    spec_token,
                    Arc::clone(&state.llm),
                    Arc::clone(&state.tts),
                    Arc::clone(&state.opener_cache),
                    &menu_context,
                    &products,
                    &history,
                    &spec_transcript_for_task,
                    out_tx,
                )
                .await
            }),
            spec_transcript,
        ))
    } else {
        None
    };

    let final_outcome = tokio::select! {
        _ = token.cancelled() => {
            if let Some((handle, _)) = speculative { handle.abort(); }
            return (Err(CoreError::Cancelled), partial_text);
        }
        result = state.stt.transcribe(audio, true) => result,
    };

    let final_text = match final_outcome {
        Ok(TranscribeOutcome::Text { text, .. }) => merge(&partial_text, &text),
        Ok(TranscribeOutcome::Skipped) if speculative.is_none() => {
            return (Err(CoreError::AudioTooSmall), partial_text);
        }
        Ok(TranscribeOutcome::Skipped) => partial_text.clone(),
        Err(e) if speculative.is_none() => {
            let _ = out_tx
                .send(OutboundFrame::Event(ServerEvent::Error {
                    message: e.to_string(),
                }))
                .await;
            return (Err(e), partial_text);
        }
        Err(_) => partial_text.clone(),
    };

    let _ = out_tx
        .send(OutboundFrame::Event(ServerEvent::Transcript {
            text: final_text.clone(),
            is_final: true,
        }))
        .await;

    match speculative {
        Some((handle, spec_transcript)) => {
            let ratio = overlap_ratio(&spec_transcript, &final_text);
            if ratio >= state.turn_config.speculation_overlap_threshold {
                info!("speculative turn adopted (overlap={ratio:.2})");
                let mut handle = handle;
                let outcome = tokio::select! {
                    _ = token.cancelled() => {
                        handle.abort();
                        return (Err(CoreError::Cancelled), final_text);
                    }
                    result = &mut handle => result,
                };
                match outcome {
                    Ok(result) => (result, spec_transcript),
                    Err(e) => (Err(CoreError::Channel(e.to_string())), final_text),
                }
            } else {
                info!("speculative turn discarded (overlap={ratio:.2}), restarting on final transcript");
                handle.abort();
                let fresh_token = token.child_token();
                let outcome = tokio::select! {
                    _ = token.cancelled() => return (Err(CoreError::Cancelled), final_text),
                    result = run_turn(
                        fresh_token,
                        Arc::clone(&state.llm),
                        Arc::clone(&state.tts),
                        Arc::clone(&state.opener_cache),
                        &menu_context,
                        &products,
                        &history,
                        &final_text,
                        out_tx,
                    ) => result,
                };
                (outcome, final_text)
            }
        }
        None => {
            let fresh_token = token.child_token();
            let outcome = tokio::select! {
                _ = token.cancelled() => return (Err(CoreError::Cancelled), final_text),
                result = run_turn(
                    fresh_token,
                    Arc::clone(&state.llm),
                    Arc::clone(&state.tts),
                    Arc::clone(&state.opener_cache),
                    &menu_context,
                    &products,
                    &history,
                    &final_text,
                    out_tx,
                ) => result,
            };
            (outcome, final_text)
        }
    }
}

async fn on_interrupt(
    session: &mut VoiceSession,
    out_tx: &mpsc::Sender<OutboundFrame>,
    partial_rx: &mut Option<mpsc::Receiver<CoreResult<TranscribeOutcome>>>,
    resolution: &mut Option<tokio::task::JoinHandle<(CoreResult<TurnOutcome>, String)>>,
) {
    session.cancel_active_work();
    *partial_rx = None;
    if let Some(handle) = resolution.take() {
        handle.abort();
    }
    session.reset_for_new_input();
    session.state = SessionState::Interrupted;
    let _ = out_tx.send(OutboundFrame::Event(ServerEvent::InterruptAck)).await;
    session.state = SessionState::Listening;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::fake::{FakeLlmClient, FakeSttClient, FakeTtsClient};
    use crate::clients::{LlmClient, SttClient, TranscribeOutcome};
    use crate::config::TurnConfig;
    use crate::opener_cache::OpenerCache;
    use crate::scope::ScopeResolver;
    use crate::scope::{FakeScopeResolver, Scope};

    fn test_state(stt: Arc<dyn SttClient>, llm: Arc<dyn LlmClient>) -> Arc<AppState> {
        AppState::for_test(
            stt,
            llm,
            Arc::new(FakeTtsClient::new(8)),
            Arc::new(OpenerCache::empty()),
            Arc::new(FakeScopeResolver::not_found()),
            TurnConfig::default(),
        )
    }

    #[tokio::test]
    async fn speculative_hit_adopts_speculative_output() {
        let stt: Arc<dyn SttClient> = Arc::new(FakeSttClient::always("what do you recommend for dessert"));
        let llm: Arc<dyn LlmClient> = Arc::new(FakeLlmClient::from_text(
            r#"{"spoken_response":"Here's what I'd recommend.","intent":"recommend","recommendation":null}"#,
        ));
        let state = test_state(stt, llm);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let token = CancellationToken::new();

        let (outcome, transcript) = resolve_audio_end(
            state,
            token,
            "what do you recommend for dessert".to_owned(),
            Bytes::from_static(b"audio"),
            vec![],
            "Menu".to_owned(),
            vec![],
            out_tx,
        )
        .await;

        assert!(outcome.is_ok());
        assert_eq!(transcript, "what do you recommend for dessert");
        out_rx.close();
    }

    #[tokio::test]
    async fn speculative_miss_restarts_on_final_transcript() {
        // The partial guess ("I really want") is a prefix of the final
        // full-utterance transcript, so `merge` folds them without
        // duplication, but the continuation diverges enough (0.5 overlap)
        // to fall below the 0.7 adoption threshold and force a restart.
        let stt: Arc<dyn SttClient> = Arc::new(FakeSttClient::always("I really want tea not coffee"));
        let llm: Arc<dyn LlmClient> = Arc::new(FakeLlmClient::from_text(
            r#"{"spoken_response":"Sure, coming right up.","intent":"add"}"#,
        ));
        let state = test_state(stt, llm);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let token = CancellationToken::new();

        let (outcome, transcript) = resolve_audio_end(
            state,
            token,
            "I really want".to_owned(),
            Bytes::from_static(b"audio"),
            vec![],
            "Menu".to_owned(),
            vec![],
            out_tx,
        )
        .await;

        assert!(outcome.is_ok());
        assert_eq!(transcript, "I really want tea not coffee");
        out_rx.close();
    }

    #[tokio::test]
    async fn skipped_audio_with_no_speculation_surfaces_error() {
        let stt: Arc<dyn SttClient> =
            Arc::new(FakeSttClient::scripted(vec![TranscribeOutcome::Skipped]));
        let llm: Arc<dyn LlmClient> = Arc::new(FakeLlmClient::from_text(""));
        let state = test_state(stt, llm);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let token = CancellationToken::new();

        let (outcome, _) = resolve_audio_end(
            state,
            token,
            String::new(),
            Bytes::from_static(b"a"),
            vec![],
            "Menu".to_owned(),
            vec![],
            out_tx,
        )
        .await;

        assert!(matches!(outcome, Err(CoreError::AudioTooSmall)));
        out_rx.close();
    }

    #[tokio::test]
    async fn build_state_smoke_uses_fake_scope_resolver() {
        let resolver = FakeScopeResolver::with_scope(Scope {
            scope_id: "t1".to_owned(),
            products: vec![],
            menu_context: String::new(),
        });
        assert!(resolver.lookup_scope("anything").await.is_ok());
    }
}

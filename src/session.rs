//! Per-connection state: the audio buffer, scheduling timestamps,
//! cancellation handles, and short conversation history for one active
//! voice session.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clients::HistoryTurn;
use crate::config::TurnConfig;
use crate::scope::Scope;

/// Where a session is in the turn lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    ProcessingStt,
    GeneratingLlm,
    StreamingTts,
    Interrupted,
}

/// Per-connection voice session state.
pub struct VoiceSession {
    pub session_id: Uuid,
    pub scope: Scope,
    pub state: SessionState,

    audio_buffer: BytesMut,
    max_buffer_bytes: usize,

    pub chunk_count: u32,
    pub last_partial_stt_time: Option<Instant>,
    pub last_chunk_time: Option<Instant>,
    pub start_time: Instant,
    /// Wall-clock open time, carried for structured logs and `/healthz`
    /// reporting; all internal scheduling uses the monotonic `start_time`.
    pub connected_at: chrono::DateTime<chrono::Utc>,

    pub partial_transcript: String,
    pub full_transcript: String,

    /// Cancellation scope rooted at this connection; cancelling it cancels
    /// every task the session has spawned.
    pub connection_token: CancellationToken,
    /// Child token for the currently in-flight partial STT, if any.
    pub partial_stt_token: Option<CancellationToken>,
    /// Child token for the currently active turn (speculative or final).
    pub turn_token: Option<CancellationToken>,

    history: VecDeque<HistoryTurn>,
    max_history_turns: usize,
}

impl VoiceSession {
    pub fn new(scope: Scope, config: &TurnConfig) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            scope,
            state: SessionState::Idle,
            audio_buffer: BytesMut::new(),
            max_buffer_bytes: config.max_audio_buffer_bytes,
            chunk_count: 0,
            last_partial_stt_time: None,
            last_chunk_time: None,
            start_time: Instant::now(),
            connected_at: chrono::Utc::now(),
            partial_transcript: String::new(),
            full_transcript: String::new(),
            connection_token: CancellationToken::new(),
            partial_stt_token: None,
            turn_token: None,
            history: VecDeque::new(),
            max_history_turns: config.max_history_turns,
        }
    }

    /// Append inbound audio, dropping the oldest bytes if the buffer would
    /// exceed its cap.
    pub fn push_audio(&mut self, frame: &[u8]) {
        self.audio_buffer.extend_from_slice(frame);
        self.chunk_count += 1;
        self.last_chunk_time = Some(Instant::now());

        if self.audio_buffer.len() > self.max_buffer_bytes {
            let overflow = self.audio_buffer.len() - self.max_buffer_bytes;
            let _ = self.audio_buffer.split_to(overflow);
        }
    }

    /// Snapshot the buffered audio without clearing it.
    pub fn audio_snapshot(&self) -> Bytes {
        self.audio_buffer.clone().freeze()
    }

    /// Whether enough audio has accumulated, and enough time has passed
    /// since the last attempt, to justify another partial transcription.
    pub fn can_process_partial_stt(&self, config: &TurnConfig) -> bool {
        if self.partial_stt_token.is_some() {
            return false;
        }
        if self.chunk_count < config.min_chunks_for_partial {
            return false;
        }
        match self.last_partial_stt_time {
            None => true,
            Some(t) => t.elapsed() >= config.partial_stt_min_interval,
        }
    }

    /// Clear the audio buffer and chunk counter, typically once its
    /// contents have been fully consumed by a final transcription.
    pub fn clear_audio(&mut self) {
        self.audio_buffer.clear();
        self.chunk_count = 0;
    }

    /// Reset everything tied to one utterance, ready to listen for the
    /// next one.
    pub fn reset_for_new_input(&mut self) {
        self.clear_audio();
        self.partial_transcript.clear();
        self.full_transcript.clear();
        self.last_partial_stt_time = None;
        self.partial_stt_token = None;
        self.turn_token = None;
        self.state = SessionState::Idle;
    }

    /// Cancel whatever partial STT and turn are in flight. Returns the
    /// tokens that were cancelled so the caller can await their tasks.
    pub fn cancel_active_work(&mut self) {
        if let Some(token) = self.partial_stt_token.take() {
            token.cancel();
        }
        if let Some(token) = self.turn_token.take() {
            token.cancel();
        }
    }

    pub fn begin_partial_stt(&mut self) -> CancellationToken {
        let token = self.connection_token.child_token();
        self.partial_stt_token = Some(token.clone());
        self.last_partial_stt_time = Some(Instant::now());
        self.chunk_count = 0;
        token
    }

    pub fn finish_partial_stt(&mut self) {
        self.partial_stt_token = None;
    }

    pub fn begin_turn(&mut self) -> CancellationToken {
        let token = self.connection_token.child_token();
        self.turn_token = Some(token.clone());
        token
    }

    pub fn finish_turn(&mut self) {
        self.turn_token = None;
    }

    /// Record a completed turn into bounded history.
    pub fn push_history(&mut self, user: String, assistant: String) {
        self.history.push_back(HistoryTurn { user, assistant });
        while self.history.len() > self.max_history_turns {
            self.history.pop_front();
        }
    }

    pub fn history(&self) -> Vec<HistoryTurn> {
        self.history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;
    use std::time::Duration;

    fn test_scope() -> Scope {
        Scope {
            scope_id: "t".to_owned(),
            products: vec![],
            menu_context: String::new(),
        }
    }

    #[test]
    fn audio_buffer_caps_and_drops_oldest_bytes() {
        let mut config = TurnConfig::default();
        config.max_audio_buffer_bytes = 8;
        let mut session = VoiceSession::new(test_scope(), &config);

        session.push_audio(&[1, 2, 3, 4, 5]);
        session.push_audio(&[6, 7, 8, 9, 10]);

        assert_eq!(session.audio_snapshot().len(), 8);
        assert_eq!(&session.audio_snapshot()[..], &[3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn can_process_partial_stt_requires_min_chunks_and_interval() {
        let config = TurnConfig {
            min_chunks_for_partial: 2,
            partial_stt_min_interval: Duration::from_millis(600),
            ..TurnConfig::default()
        };
        let mut session = VoiceSession::new(test_scope(), &config);

        assert!(!session.can_process_partial_stt(&config));
        session.push_audio(b"a");
        assert!(!session.can_process_partial_stt(&config));
        session.push_audio(b"b");
        assert!(session.can_process_partial_stt(&config));

        let _token = session.begin_partial_stt();
        assert!(!session.can_process_partial_stt(&config));
    }

    #[test]
    fn history_is_bounded() {
        let config = TurnConfig {
            max_history_turns: 2,
            ..TurnConfig::default()
        };
        let mut session = VoiceSession::new(test_scope(), &config);
        session.push_history("a".into(), "A".into());
        session.push_history("b".into(), "B".into());
        session.push_history("c".into(), "C".into());

        let history = session.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].user, "b");
        assert_eq!(history[1].user, "c");
    }
}

//! JSON message shapes exchanged with the client, plus the internal
//! outbound-frame type the turn controller and bridge use to talk to the
//! websocket writer task.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::envelope::ReplyEnvelope;
use crate::scope::Product;

/// Control messages the client sends as text frames. Audio itself arrives
/// as binary frames and is handled separately by the controller.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    AudioEnd,
    Interrupt,
    PlaybackComplete,
}

/// Events emitted to the client as text frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Status { message: String },
    Pong,
    PartialTranscript { text: String, confidence: f32, is_final: bool },
    Transcript { text: String, is_final: bool },
    AiToken { token: String, full_text: String },
    AiComplete { data: ReplyEnvelope },
    Recommendation { product: Product },
    TtsStart,
    TtsComplete,
    InterruptAck,
    Error { message: String },
    Greeting { text: String },
}

/// One unit of outbound work for the websocket writer: a JSON event or a
/// raw audio chunk.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Event(ServerEvent),
    Audio(Bytes),
}

impl From<ServerEvent> for OutboundFrame {
    fn from(event: ServerEvent) -> Self {
        OutboundFrame::Event(event)
    }
}

//! Periodic minimal-payload calls to the STT and TTS endpoints, to keep
//! provider-side containers from going cold between real turns.
//!
//! Failures here are logged and ignored: the goal is socket warmth, not
//! correctness, and a warm-up failure must never surface to a client.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::clients::http::KEEP_WARM_TIMEOUT;
use crate::clients::{SttClient, TtsClient};

/// A minimal, provider-accepted audio payload. A few bytes of a WebM
/// cluster header is enough to get a response out of most STT endpoints
/// without costing a meaningful amount of decode time.
const WARMUP_AUDIO: &[u8] = &[0x1a, 0x45, 0xdf, 0xa3, 0x9f, 0x42, 0x86, 0x81, 0x01];

/// Handle to a running keep-warm task. Dropping this does not stop the
/// task; call [`KeepWarmPinger::stop`] explicitly during shutdown.
pub struct KeepWarmPinger {
    handle: JoinHandle<()>,
}

impl KeepWarmPinger {
    /// Start pinging both endpoints every `interval`.
    pub fn start(
        stt: Arc<dyn SttClient>,
        tts: Arc<dyn TtsClient>,
        interval: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                ping_stt(&stt).await;
                ping_tts(&tts).await;
            }
        });
        Self { handle }
    }

    /// Stop the pinger. Safe to call more than once.
    pub fn stop(self) {
        self.handle.abort();
    }
}

async fn ping_stt(stt: &Arc<dyn SttClient>) {
    debug!("keep-warm: pinging STT");
    let call = stt.transcribe(Bytes::from_static(WARMUP_AUDIO), false);
    match tokio::time::timeout(KEEP_WARM_TIMEOUT, call).await {
        Ok(Err(e)) => warn!("keep-warm STT ping failed (ignored): {e}"),
        Err(_) => warn!("keep-warm STT ping timed out after {KEEP_WARM_TIMEOUT:?} (ignored)"),
        Ok(Ok(_)) => {}
    }
}

async fn ping_tts(tts: &Arc<dyn TtsClient>) {
    debug!("keep-warm: pinging TTS");
    let drain = async {
        match tts.synthesize_stream(".").await {
            Ok(mut stream) => {
                while let Some(chunk) = stream.next().await {
                    if let Err(e) = chunk {
                        warn!("keep-warm TTS ping failed mid-stream (ignored): {e}");
                        break;
                    }
                }
            }
            Err(e) => warn!("keep-warm TTS ping failed (ignored): {e}"),
        }
    };
    if tokio::time::timeout(KEEP_WARM_TIMEOUT, drain).await.is_err() {
        warn!("keep-warm TTS ping timed out after {KEEP_WARM_TIMEOUT:?} (ignored)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::fake::{FakeSttClient, FakeTtsClient};

    #[tokio::test]
    async fn pings_both_endpoints_without_panicking() {
        let stt: Arc<dyn SttClient> = Arc::new(FakeSttClient::always("ok"));
        let tts: Arc<dyn TtsClient> = Arc::new(FakeTtsClient::new(4));
        let pinger = KeepWarmPinger::start(stt, tts, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(60)).await;
        pinger.stop();
    }
}

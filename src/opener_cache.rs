//! Pre-synthesised audio for a fixed set of reply-opening phrases.
//!
//! Populated once at startup: any phrase missing from the on-disk mirror is
//! synthesised via the TTS client and written down, so restarts don't pay
//! for it again. Read-only for the lifetime of the process afterward.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::clients::TtsClient;
use crate::error::Result;

/// Normalise a phrase for cache lookup: lowercase, collapse internal
/// whitespace, trim.
fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Byte-offset spans of each whitespace-delimited word in `text`, as
/// `(word, start, end)` with `end` exclusive.
fn word_spans(text: &str) -> Vec<(&str, usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((&text[s..idx], s, idx));
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    if let Some(s) = start {
        spans.push((&text[s..], s, text.len()));
    }
    spans
}

fn cache_filename(normalized: &str) -> String {
    let digest = normalized
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |hash, b| {
            (hash ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
        });
    format!("{digest:016x}.pcm")
}

/// Read-only, process-wide cache of opener-phrase audio.
pub struct OpenerCache {
    /// Normalized phrase -> audio bytes, longest phrases first so prefix
    /// lookup finds the most specific match.
    entries: Vec<(String, Bytes)>,
}

impl OpenerCache {
    /// Populate the cache: load each phrase's audio from `dir` if present,
    /// otherwise synthesise it and write it down.
    pub async fn load_or_generate_all(
        phrases: &[String],
        dir: &Path,
        tts: &Arc<dyn TtsClient>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        let mut entries = Vec::with_capacity(phrases.len());
        for phrase in phrases {
            let normalized = normalize(phrase);
            if normalized.is_empty() {
                continue;
            }
            let path = dir.join(cache_filename(&normalized));

            let audio = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                match tokio::fs::read(&path).await {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(e) => {
                        warn!("failed to read cached opener audio {}: {e}, regenerating", path.display());
                        synthesize_and_store(tts, phrase, &path).await?
                    }
                }
            } else {
                synthesize_and_store(tts, phrase, &path).await?
            };

            info!("opener cache ready: \"{phrase}\" ({} bytes)", audio.len());
            entries.push((normalized, audio));
        }

        entries.sort_by_key(|(k, _)| std::cmp::Reverse(k.len()));
        Ok(Self { entries })
    }

    /// An empty cache, useful for tests and for a from-scratch config with
    /// no configured opener phrases.
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// Find the longest cached opener whose normalized form is a prefix of
    /// `text`. Returns the cached audio and the unconsumed remainder of
    /// `text` (the original text with the matched words stripped from the
    /// front).
    pub fn match_prefix<'a>(&self, text: &'a str) -> Option<(Bytes, &'a str)> {
        let words = word_spans(text);

        for (key, audio) in &self.entries {
            let key_words: Vec<&str> = key.split_whitespace().collect();
            if key_words.len() > words.len() {
                continue;
            }
            let matches = words
                .iter()
                .zip(key_words.iter())
                .all(|((w, _, _), k)| w.to_lowercase() == *k);
            if matches {
                let end = words[key_words.len() - 1].2;
                return Some((audio.clone(), text[end..].trim_start()));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

async fn synthesize_and_store(
    tts: &Arc<dyn TtsClient>,
    phrase: &str,
    path: &PathBuf,
) -> Result<Bytes> {
    info!("synthesizing opener phrase: \"{phrase}\"");
    let mut stream = tts.synthesize_stream(phrase).await?;
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    tokio::fs::write(path, &buf).await?;
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::fake::FakeTtsClient;

    #[tokio::test]
    async fn load_generates_and_caches_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let tts: Arc<dyn TtsClient> = Arc::new(FakeTtsClient::new(16));
        let phrases = vec!["Of course, I'll add that to your cart.".to_owned()];

        let cache = OpenerCache::load_or_generate_all(&phrases, dir.path(), &tts)
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);

        // Second load reads from disk rather than re-synthesising.
        let cache2 = OpenerCache::load_or_generate_all(&phrases, dir.path(), &tts)
            .await
            .unwrap();
        assert_eq!(cache2.len(), 1);
    }

    #[test]
    fn prefix_match_returns_cached_audio_and_remainder() {
        let cache = OpenerCache {
            entries: vec![("of course, i'll add that to your cart.".to_owned(), Bytes::from_static(b"cached"))],
        };

        let (audio, rest) = cache
            .match_prefix("Of course, I'll add that to your cart. One Adana kebab coming up.")
            .unwrap();
        assert_eq!(audio, Bytes::from_static(b"cached"));
        assert_eq!(rest, "One Adana kebab coming up.");
    }

    #[test]
    fn no_match_returns_none() {
        let cache = OpenerCache {
            entries: vec![("great choice!".to_owned(), Bytes::from_static(b"cached"))],
        };
        assert!(cache.match_prefix("I'm not sure about that.").is_none());
    }

    #[test]
    fn longest_entry_wins_when_multiple_prefixes_match() {
        let cache = OpenerCache {
            entries: vec![
                ("got it, here's".to_owned(), Bytes::from_static(b"long")),
                ("got it".to_owned(), Bytes::from_static(b"short")),
            ],
        };
        let (audio, _) = cache.match_prefix("Got it, here's your total.").unwrap();
        assert_eq!(audio, Bytes::from_static(b"long"));
    }
}

//! Full-duplex voice ordering core: turns a stream of compressed audio into
//! a structured ordering decision and a stream of reply audio.
//!
//! # Architecture
//!
//! One connection, one [`session::VoiceSession`], driven by
//! [`controller::handle_connection`]:
//! - **Inference clients** ([`clients`]): thin adapters over remote STT,
//!   LLM, and TTS endpoints.
//! - **Keep-warm pinger** ([`keepwarm`]): periodic no-op calls so provider
//!   containers don't go cold between turns.
//! - **Opener cache** ([`opener_cache`]): pre-synthesised audio for a fixed
//!   set of reply-opening phrases.
//! - **Transcript merger** ([`merger`]): de-duplicates overlapping partial
//!   transcripts.
//! - **Streaming bridge** ([`bridge`]): drives one turn's LLM + TTS
//!   orchestration, including speculative TTS on the first sentence.
//! - **Turn controller** ([`controller`]): the connection-level state
//!   machine tying it all together, including speculative execution and
//!   barge-in.

pub mod bridge;
pub mod clients;
pub mod config;
pub mod controller;
pub mod envelope;
pub mod error;
pub mod keepwarm;
pub mod merger;
pub mod opener_cache;
pub mod scope;
pub mod server;
pub mod session;
pub mod wire;

pub use config::AppConfig;
pub use error::{CoreError, Result};

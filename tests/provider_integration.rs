//! Integration tests for the HTTP-backed inference clients against a mock
//! provider server, exercising the real request/response wire shapes rather
//! than the in-memory fakes used by the unit tests.

use garson_voice_core::clients::http::{HttpLlmClient, HttpProvider, HttpSttClient, HttpTtsClient};
use garson_voice_core::clients::{LlmClient, LlmEvent, SttClient, TranscribeOutcome, TtsClient};
use garson_voice_core::config::ProviderConfig;
use tokio_stream::StreamExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider_config(base_url: String) -> ProviderConfig {
    ProviderConfig {
        base_url,
        api_key: "test-key".to_owned(),
        ..ProviderConfig::default()
    }
}

#[tokio::test]
async fn stt_client_parses_transcription_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/audio/transcriptions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "text": "what do you recommend for dessert",
            "confidence": 0.92
        })))
        .mount(&server)
        .await;

    let provider = HttpProvider::new(provider_config(server.uri())).unwrap();
    let client = HttpSttClient::new(provider, 10);

    let outcome = client
        .transcribe(bytes::Bytes::from_static(&[0u8; 64]), true)
        .await
        .unwrap();

    match outcome {
        TranscribeOutcome::Text { text, confidence } => {
            assert_eq!(text, "what do you recommend for dessert");
            assert!((confidence - 0.92).abs() < 1e-6);
        }
        TranscribeOutcome::Skipped => panic!("expected a transcript, got Skipped"),
    }
}

#[tokio::test]
async fn stt_client_below_min_bytes_skips_without_a_call() {
    let server = MockServer::start().await;
    // No mock mounted: a call would fail the test via an unexpected request.
    let provider = HttpProvider::new(provider_config(server.uri())).unwrap();
    let client = HttpSttClient::new(provider, 1024);

    let outcome = client
        .transcribe(bytes::Bytes::from_static(&[0u8; 16]), false)
        .await
        .unwrap();

    assert!(matches!(outcome, TranscribeOutcome::Skipped));
}

#[tokio::test]
async fn llm_client_streams_sse_deltas_to_completion() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Of course, \"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"I'll add that.\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&server)
        .await;

    let provider = HttpProvider::new(provider_config(server.uri())).unwrap();
    let client = HttpLlmClient::new(provider);

    let mut stream = client
        .generate_stream("system prompt", &[], "add a kunefe")
        .await
        .unwrap();

    let mut tokens = Vec::new();
    let mut done_text = None;
    while let Some(event) = stream.next().await {
        match event.unwrap() {
            LlmEvent::Token(t) => tokens.push(t),
            LlmEvent::Done { accumulated_text } => done_text = Some(accumulated_text),
        }
    }

    assert_eq!(tokens, vec!["Of course, ".to_owned(), "I'll add that.".to_owned()]);
    assert_eq!(done_text.as_deref(), Some("Of course, I'll add that."));
}

#[tokio::test]
async fn tts_client_streams_raw_audio_bytes() {
    let server = MockServer::start().await;
    let audio = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
    Mock::given(method("POST"))
        .and(path("/audio/speech"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(audio.clone()))
        .mount(&server)
        .await;

    let provider = HttpProvider::new(provider_config(server.uri())).unwrap();
    let client = HttpTtsClient::new(provider);

    let mut stream = client.synthesize_stream("Of course.").await.unwrap();
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }

    assert_eq!(collected, audio);
}

#[tokio::test]
async fn provider_permanent_error_on_4xx_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/audio/speech"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .mount(&server)
        .await;

    let provider = HttpProvider::new(provider_config(server.uri())).unwrap();
    let client = HttpTtsClient::new(provider);

    let result = client.synthesize_stream("hello").await;
    assert!(result.is_err());
}

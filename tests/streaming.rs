//! Tests for the OpenAI-compatible HTTP adapter: SSE translation into
//! canonical frames, unary completion parsing, and upstream failure
//! classification, against a raw mock TCP server.

use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use gale::codec;
use gale::provider::openai::OpenAiProvider;
use gale::provider::{Provider, ProviderReply, ProviderRequestOptions};
use gale::{ContentSource, EventData, ResultCode};

/// Bind a TCP listener on localhost and return (listener, port).
async fn mock_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

const SSE_HEADERS: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: text/event-stream\r\n\
    Connection: close\r\n\r\n";

/// Format an upstream chat-completions SSE chunk.
fn sse_chunk(content: &str) -> String {
    format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}},\"finish_reason\":null}}]}}\n\n")
}

fn sse_finish(reason: &str) -> String {
    format!("data: {{\"choices\":[{{\"delta\":{{}},\"finish_reason\":\"{reason}\"}}]}}\n\n")
}

fn json_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

fn error_response(status: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

fn stream_options() -> ProviderRequestOptions {
    ProviderRequestOptions { stream: true, ..ProviderRequestOptions::default() }
}

async fn collect_frames(reply: ProviderReply) -> Vec<gale::Event> {
    let mut frames = match reply {
        ProviderReply::Stream(frames) => frames,
        ProviderReply::Content(_) => panic!("expected a stream"),
    };
    let mut wire = Vec::new();
    while let Some(item) = frames.next().await {
        wire.extend_from_slice(&item.unwrap());
    }
    codec::decode(&wire)
}

// ---------------------------------------------------------------------------
// Streaming translation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn streaming_chunks_translate_to_canonical_frames() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;

        socket.write_all(SSE_HEADERS).await.unwrap();
        socket.write_all(sse_chunk("Hello ").as_bytes()).await.unwrap();
        socket.write_all(sse_chunk("world!").as_bytes()).await.unwrap();
        socket.write_all(sse_finish("stop").as_bytes()).await.unwrap();
        socket.write_all(b"data: [DONE]\n\n").await.unwrap();
    });

    let provider = OpenAiProvider::new("test-key", format!("http://127.0.0.1:{port}/v1/chat"));
    let reply = provider.request("m", "hi", &stream_options()).await.unwrap();

    let events = collect_frames(reply).await;
    assert_eq!(events.len(), 3);
    assert_eq!(
        events[0].data,
        EventData::Content { source: ContentSource::Response, text: "Hello ".into() }
    );
    assert_eq!(
        events[1].data,
        EventData::Content { source: ContentSource::Response, text: "world!".into() }
    );
    assert_eq!(events[2].data, EventData::End { result: ResultCode::Complete });

    server.await.unwrap();
}

#[tokio::test]
async fn length_finish_reason_maps_to_incomplete_max_tokens() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;

        socket.write_all(SSE_HEADERS).await.unwrap();
        socket.write_all(sse_chunk("truncated").as_bytes()).await.unwrap();
        socket.write_all(sse_finish("length").as_bytes()).await.unwrap();
        socket.write_all(b"data: [DONE]\n\n").await.unwrap();
    });

    let provider = OpenAiProvider::new("test-key", format!("http://127.0.0.1:{port}/v1/chat"));
    let reply = provider.request("m", "hi", &stream_options()).await.unwrap();

    let events = collect_frames(reply).await;
    assert_eq!(
        events.last().unwrap().data,
        EventData::End { result: ResultCode::IncompleteMaxTokens }
    );

    server.await.unwrap();
}

#[tokio::test]
async fn on_stream_chunk_transform_applies_per_chunk() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;

        socket.write_all(SSE_HEADERS).await.unwrap();
        socket.write_all(sse_chunk("abc").as_bytes()).await.unwrap();
        socket.write_all(sse_finish("stop").as_bytes()).await.unwrap();
        socket.write_all(b"data: [DONE]\n\n").await.unwrap();
    });

    let provider = OpenAiProvider::new("test-key", format!("http://127.0.0.1:{port}/v1/chat"));
    let options = ProviderRequestOptions {
        stream: true,
        on_stream_chunk: Some(std::sync::Arc::new(|chunk: String| chunk.to_uppercase())),
        ..ProviderRequestOptions::default()
    };
    let reply = provider.request("m", "hi", &options).await.unwrap();

    let events = collect_frames(reply).await;
    assert_eq!(
        events[0].data,
        EventData::Content { source: ContentSource::Response, text: "ABC".into() }
    );

    server.await.unwrap();
}

#[tokio::test]
async fn transport_failure_midstream_becomes_error_frame() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;

        socket.write_all(SSE_HEADERS).await.unwrap();
        socket.write_all(sse_chunk("part").as_bytes()).await.unwrap();
        // Abort mid-stream without [DONE] or finish_reason.
        drop(socket);
    });

    let provider = OpenAiProvider::new("test-key", format!("http://127.0.0.1:{port}/v1/chat"));
    let reply = provider.request("m", "hi", &stream_options()).await.unwrap();

    let events = collect_frames(reply).await;
    // The adapter ends the frame stream without a terminator; synthesizing
    // `end{COMPLETE}` is the pipeline's job.
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].data,
        EventData::Content { source: ContentSource::Response, text: "part".into() }
    );

    server.await.unwrap();
}

// ---------------------------------------------------------------------------
// Unary completion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unary_completion_parses_text_and_result() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;
        let body = r#"{"choices":[{"message":{"content":"All good"},"finish_reason":"stop"}]}"#;
        socket.write_all(&json_response(body)).await.unwrap();
    });

    let provider = OpenAiProvider::new("test-key", format!("http://127.0.0.1:{port}/v1/chat"));
    let reply = provider
        .request("m", "hi", &ProviderRequestOptions::default())
        .await
        .unwrap();

    match reply {
        ProviderReply::Content(content) => {
            assert_eq!(content.text, "All good");
            assert_eq!(content.result, ResultCode::Complete);
        }
        ProviderReply::Stream(_) => panic!("expected content"),
    }

    server.await.unwrap();
}

#[tokio::test]
async fn empty_completed_body_raises_no_content() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;
        let body = r#"{"choices":[{"message":{"content":""},"finish_reason":"stop"}]}"#;
        socket.write_all(&json_response(body)).await.unwrap();
    });

    let provider = OpenAiProvider::new("test-key", format!("http://127.0.0.1:{port}/v1/chat"));
    let err = provider
        .request("m", "hi", &ProviderRequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PROVIDER_RESPONSE_NO_CONTENT");

    server.await.unwrap();
}

#[tokio::test]
async fn empty_max_tokens_body_raises_max_tokens_error() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;
        let body = r#"{"choices":[{"message":{"content":""},"finish_reason":"length"}]}"#;
        socket.write_all(&json_response(body)).await.unwrap();
    });

    let provider = OpenAiProvider::new("test-key", format!("http://127.0.0.1:{port}/v1/chat"));
    let err = provider
        .request("m", "hi", &ProviderRequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PROVIDER_RESPONSE_MAX_TOKENS_ERROR");

    server.await.unwrap();
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_429_maps_to_rate_limit_with_retry_after() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;
        socket
            .write_all(
                b"HTTP/1.1 429 Too Many Requests\r\nRetry-After: 7\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
    });

    let provider = OpenAiProvider::new("test-key", format!("http://127.0.0.1:{port}/v1/chat"));
    let err = provider
        .request("m", "hi", &ProviderRequestOptions::default())
        .await
        .unwrap_err();
    match err {
        gale::GaleError::RateLimit { wait_seconds, .. } => assert_eq!(wait_seconds, 7),
        other => panic!("expected rate limit, got {other:?}"),
    }

    server.await.unwrap();
}

#[tokio::test]
async fn quota_error_body_maps_to_exceeded_quota() {
    let (listener, port) = mock_listener().await;

    // 429 is classified as a rate limit before the body is read, so the
    // quota path is exercised behind a 403.
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;
        let body = r#"{"error":{"message":"You exceeded your current quota","type":"insufficient_quota"}}"#;
        socket.write_all(&error_response("403 Forbidden", body)).await.unwrap();
    });

    let provider = OpenAiProvider::new("test-key", format!("http://127.0.0.1:{port}/v1/chat"));
    let err = provider
        .request("m", "hi", &ProviderRequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PROVIDER_EXCEEDED_QUOTA_ERROR");

    server.await.unwrap();
}

#[tokio::test]
async fn server_error_maps_to_provider_response_error() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;
        let body = r#"{"error":{"message":"upstream exploded","type":"server_error"}}"#;
        socket.write_all(&error_response("500 Internal Server Error", body)).await.unwrap();
    });

    let provider = OpenAiProvider::new("test-key", format!("http://127.0.0.1:{port}/v1/chat"));
    let err = provider
        .request("m", "hi", &ProviderRequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PROVIDER_RESPONSE_ERROR");
    assert!(err.to_string().contains("upstream exploded"));

    server.await.unwrap();
}

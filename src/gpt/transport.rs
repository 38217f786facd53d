use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use log::{debug, warn};
use reqwest::{header, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{GptError, Result};

use super::Message;

/// Raw body frames of a streamed answer, in arrival order.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

pub enum Generation {
    Full(String),
    Stream(FrameStream),
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Generation::Full(text) => f.debug_tuple("Full").field(&text.len()).finish(),
            Generation::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    messages: &'a [Message],
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateBody {
    content: Option<String>,
    error: Option<String>,
}

/// Talks to the generation endpoint. One call, one request, no retries.
#[derive(Debug, Clone)]
pub struct Transport {
    http: Client,
    endpoint: String,
}

impl Transport {
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self::with_client(http, endpoint))
    }

    pub fn with_client(http: Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }

    pub async fn generate(&self, messages: &[Message], stream: bool) -> Result<Generation> {
        if messages.is_empty() {
            return Err(GptError::InvalidArgument("no messages to send".into()));
        }

        debug!("POST {} ({} messages, stream={})", self.endpoint, messages.len(), stream);
        let response = self
            .http
            .post(&self.endpoint)
            .json(&GenerateRequest { messages, stream })
            .send()
            .await
            .map_err(|e| {
                warn!("Generation request failed: {}", e);
                GptError::from(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(response).await);
        }

        if stream {
            let frames = response
                .bytes_stream()
                .map(|frame| frame.map(|bytes| bytes.to_vec()).map_err(GptError::from));
            return Ok(Generation::Stream(Box::pin(frames)));
        }

        let body: GenerateBody = response.json().await.map_err(|e| {
            GptError::MalformedUpstreamPayload(format!("unreadable response body: {e}"))
        })?;
        match body.content {
            Some(content) => Ok(Generation::Full(content)),
            None => Err(GptError::MalformedUpstreamPayload(
                body.error.unwrap_or_else(|| "response has no content".into()),
            )),
        }
    }

    /// Non-streamed call that insists on a full text answer.
    pub async fn generate_text(&self, messages: &[Message]) -> Result<String> {
        match self.generate(messages, false).await? {
            Generation::Full(text) => Ok(text),
            Generation::Stream(_) => Err(GptError::MalformedUpstreamPayload(
                "expected a full response, got a stream".into(),
            )),
        }
    }

    pub async fn generate_stream(&self, messages: &[Message]) -> Result<FrameStream> {
        match self.generate(messages, true).await? {
            Generation::Stream(frames) => Ok(frames),
            Generation::Full(_) => Err(GptError::MalformedUpstreamPayload(
                "expected a stream, got a full response".into(),
            )),
        }
    }
}

async fn error_from_response(response: Response) -> GptError {
    let status = response.status();
    let header_hint = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<GenerateBody>(&text)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or(text);

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = header_hint
            .or_else(|| retry_hint_in(&message))
            .unwrap_or(DEFAULT_RETRY_AFTER);
        warn!("Generation endpoint is rate limiting us: {}", message);
        return GptError::RateLimited { retry_after };
    }

    warn!("Generation endpoint returned {}: {}", status, message);
    GptError::Transport(format!("status {status}: {message}"))
}

/// Picks the number out of "... Try again in 42 seconds."
fn retry_hint_in(message: &str) -> Option<Duration> {
    message.match_indices(" in ").find_map(|(at, marker)| {
        let rest = &message[at + marker.len()..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok().map(Duration::from_secs)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport_for(server: &MockServer) -> Transport {
        Transport::new(format!("{}/api/gpt", server.uri()), Duration::from_secs(5)).unwrap()
    }

    fn hello() -> Vec<Message> {
        vec![Message::user("hello")]
    }

    #[tokio::test]
    async fn full_response_returns_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/gpt"))
            .and(body_json(serde_json::json!({
                "messages": [{"role": "user", "content": "hello"}],
                "stream": false
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"content": "hi!"})))
            .expect(1)
            .mount(&server)
            .await;

        let text = transport_for(&server).generate_text(&hello()).await.unwrap();
        assert_eq!(text, "hi!");
    }

    #[tokio::test]
    async fn too_many_requests_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": "Rate limit exceeded. Try again in 42 seconds."
            })))
            .mount(&server)
            .await;

        let err = transport_for(&server).generate_text(&hello()).await.unwrap_err();
        assert!(matches!(
            err,
            GptError::RateLimited { retry_after } if retry_after == Duration::from_secs(42)
        ));
    }

    #[tokio::test]
    async fn retry_after_header_wins() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("Retry-After", "7")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let err = transport_for(&server).generate_text(&hello()).await.unwrap_err();
        assert!(matches!(
            err,
            GptError::RateLimited { retry_after } if retry_after == Duration::from_secs(7)
        ));
    }

    #[tokio::test]
    async fn server_error_is_a_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": "Failed to generate content"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = transport_for(&server).generate_text(&hello()).await.unwrap_err();
        match err {
            GptError::Transport(detail) => assert!(detail.contains("500")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn body_without_content_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"text": "?"})))
            .mount(&server)
            .await;

        let err = transport_for(&server).generate_text(&hello()).await.unwrap_err();
        assert!(matches!(err, GptError::MalformedUpstreamPayload(_)));
    }

    #[tokio::test]
    async fn streamed_body_arrives_as_frames() {
        let server = MockServer::start().await;
        let body = "data: {\"content\":\"a\"}\n\ndata: {\"content\":\"b\"}\n\n";
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let mut frames = transport_for(&server).generate_stream(&hello()).await.unwrap();
        let mut received = Vec::new();
        while let Some(frame) = frames.next().await {
            received.extend(frame.unwrap());
        }
        assert_eq!(received, body.as_bytes());
    }

    #[tokio::test]
    async fn empty_message_list_never_leaves_the_process() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = transport_for(&server).generate(&[], true).await.unwrap_err();
        assert!(matches!(err, GptError::InvalidArgument(_)));
    }

    #[test]
    fn retry_hint_parsing() {
        assert_eq!(
            retry_hint_in("Rate limit exceeded. Try again in 9 seconds."),
            Some(Duration::from_secs(9))
        );
        assert_eq!(retry_hint_in("Rate limit exceeded"), None);
        assert_eq!(
            retry_hint_in("Limit reached in the hourly window. Try again in 42 seconds."),
            Some(Duration::from_secs(42))
        );
    }
}

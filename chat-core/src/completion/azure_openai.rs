//! Azure OpenAI chat completions over REST.
//!
//! Supports both batch and server-sent-event streaming responses.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{CompletionBackend, CompletionRequest, DeltaStream, StreamChunk};
use crate::config::CompletionSettings;
use crate::error::CompletionError;
use crate::models::{
    CompletionResult, DetailLevel, Message, MessageContent, Role, SecurityContext, TokenGrant,
    Usage,
};
use crate::observability::TracedClientExt;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const SSE_DONE: &str = "[DONE]";

pub struct AzureOpenAiBackend {
    client: Client,
    endpoint: String,
    api_version: String,
    request_timeout: Duration,
}

impl AzureOpenAiBackend {
    pub fn new(settings: &CompletionSettings) -> Result<Self, CompletionError> {
        // No overall timeout on the client: streams may legitimately run long
        // and are bounded by the gateway's idle timeout instead.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| CompletionError::TransportFailure(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            api_version: settings.api_version.clone(),
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
        })
    }

    fn url(&self, deployment: &str) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, deployment, self.api_version
        )
    }

    async fn post(
        &self,
        grant: &TokenGrant,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<Response, CompletionError> {
        let body = ChatCompletionRequest::new(request, stream);

        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            max_tokens = request.max_tokens,
            stream,
            "Sending request to Azure OpenAI"
        );

        let mut builder = self
            .client
            .traced_post(&self.url(&request.model))
            .bearer_auth(grant.bearer())
            .json(&body);
        if !stream {
            builder = builder.timeout(self.request_timeout);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::error!(error = %e, "Azure OpenAI unreachable");
            CompletionError::TransportFailure(e.to_string())
        })?;

        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<Response, CompletionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::error!(status = %status, body = %body, "Azure OpenAI returned an error");

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CompletionError::AuthRejected(
            format!("Azure OpenAI returned {}", status),
        )),
        _ => Err(CompletionError::TransportFailure(format!(
            "Azure OpenAI error {}: {}",
            status, body
        ))),
    }
}

#[async_trait]
impl CompletionBackend for AzureOpenAiBackend {
    async fn complete(
        &self,
        grant: &TokenGrant,
        request: &CompletionRequest,
    ) -> Result<CompletionResult, CompletionError> {
        let response = self.post(grant, request, false).await?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CompletionError::TransportFailure(e.to_string()))?;
        let parsed: ChatCompletionResponse = serde_json::from_slice(&bytes)
            .map_err(|e| CompletionError::MalformedResponse(format!("Failed to parse response: {}", e)))?;

        parsed.into_result()
    }

    async fn stream(
        &self,
        grant: &TokenGrant,
        request: &CompletionRequest,
    ) -> Result<DeltaStream, CompletionError> {
        let response = self.post(grant, request, true).await?;

        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(pump_events(response.bytes_stream(), tx));

        Ok(Box::pin(ReceiverStream::new(rx)) as DeltaStream)
    }

    fn name(&self) -> &'static str {
        "azure_openai"
    }
}

/// Parses SSE bytes into chunks until `[DONE]`, a failure, or the receiver goes away.
async fn pump_events<S, B, E>(body: S, tx: mpsc::Sender<Result<StreamChunk, CompletionError>>)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    tokio::pin!(body);
    let mut parser = SseParser::default();

    while let Some(next) = body.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx
                    .send(Err(CompletionError::TransportFailure(e.to_string())))
                    .await;
                return;
            }
        };

        let events = match parser.feed(bytes.as_ref()) {
            Ok(events) => events,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        for event in events {
            let outcome = match event {
                SseEvent::Done => return,
                SseEvent::Data(data) => parse_chunk(&data),
            };
            let failed = outcome.is_err();
            if tx.send(outcome).await.is_err() || failed {
                // Receiver gone or stream unusable.
                return;
            }
        }
    }

    if parser.has_pending() {
        let _ = tx
            .send(Err(CompletionError::TransportFailure(
                "stream ended mid-event".to_string(),
            )))
            .await;
    }
}

fn parse_chunk(data: &str) -> Result<StreamChunk, CompletionError> {
    let chunk: ChatCompletionChunk = serde_json::from_str(data)
        .map_err(|e| CompletionError::MalformedResponse(format!("Bad stream event: {}", e)))?;

    let delta = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content);

    Ok(StreamChunk {
        delta,
        usage: chunk.usage,
    })
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Splits a byte stream into `data:` payloads.
///
/// Bytes are buffered raw so that a multi-byte character or a CRLF pair
/// split across network reads is only decoded once the event is complete.
#[derive(Debug, Default)]
struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    fn feed(&mut self, bytes: &[u8]) -> Result<Vec<SseEvent>, CompletionError> {
        self.buffer.extend_from_slice(bytes);
        collapse_crlf(&mut self.buffer);

        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let raw: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let raw = std::str::from_utf8(&raw).map_err(|e| {
                CompletionError::MalformedResponse(format!("Stream event is not UTF-8: {}", e))
            })?;

            let data: Vec<&str> = raw
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(str::trim_start)
                .collect();
            if data.is_empty() {
                continue;
            }

            let data = data.join("\n");
            if data == SSE_DONE {
                events.push(SseEvent::Done);
            } else {
                events.push(SseEvent::Data(data));
            }
        }
        Ok(events)
    }

    fn has_pending(&self) -> bool {
        self.buffer.iter().any(|b| !b.is_ascii_whitespace())
    }
}

/// Rewrites `\r\n` as `\n` in place. A trailing `\r` is kept until the
/// next read shows whether a `\n` follows it.
fn collapse_crlf(buffer: &mut Vec<u8>) {
    let mut write = 0;
    for read in 0..buffer.len() {
        if buffer[read] == b'\r' && buffer.get(read + 1) == Some(&b'\n') {
            continue;
        }
        buffer[write] = buffer[read];
        write += 1;
    }
    buffer.truncate(write);
}

// Wire types

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_security_context: Option<&'a SecurityContext>,
}

impl<'a> ChatCompletionRequest<'a> {
    fn new(request: &'a CompletionRequest, stream: bool) -> Self {
        Self {
            messages: request.messages.iter().map(WireMessage::from).collect(),
            max_tokens: request.max_tokens,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
            user_security_context: request.security_context.as_ref(),
        }
    }
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: WireContent<'a>,
}

impl<'a> From<&'a Message> for WireMessage<'a> {
    fn from(message: &'a Message) -> Self {
        let content = match message.content() {
            MessageContent::Text(text) => WireContent::Text(text),
            MessageContent::TextWithImage { text, image } => WireContent::Parts(vec![
                ContentPart::Text { text },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image.data_url(),
                        detail: image.detail(),
                    },
                },
            ]),
        };

        Self {
            role: message.role(),
            content,
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
    detail: DetailLevel,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Option<Vec<Choice>>,
    #[serde(default)]
    usage: Option<Usage>,
}

impl ChatCompletionResponse {
    fn into_result(self) -> Result<CompletionResult, CompletionError> {
        let choice = self
            .choices
            .and_then(|choices| choices.into_iter().next())
            .ok_or_else(|| CompletionError::MalformedResponse("response has no choices".to_string()))?;

        match choice
            .message
            .and_then(|m| m.content)
            .filter(|text| !text.is_empty())
        {
            Some(text) => Ok(CompletionResult::new(text, self.usage.unwrap_or_default())),
            None => {
                tracing::warn!("Completion returned no content");
                Ok(CompletionResult::apology())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ResponseMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImageRef, MessageId};

    #[test]
    fn sse_parser_handles_split_events_and_done() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"data: {\"a\":").unwrap().is_empty());

        let events = parser.feed(b"1}\r\n\r\ndata: [DONE]\n\n").unwrap();
        assert_eq!(
            events,
            vec![SseEvent::Data("{\"a\":1}".to_string()), SseEvent::Done]
        );
        assert!(!parser.has_pending());
    }

    #[test]
    fn sse_parser_skips_comments() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b": keep-alive\n\n").unwrap().is_empty());
    }

    #[test]
    fn sse_parser_keeps_characters_split_across_reads() {
        let event = "data: h\u{e9}llo \u{65e5}\u{672c}\n\n".as_bytes();
        // Second read starts inside the three-byte encoding of the first CJK character.
        let split = event.len() - 7;

        let mut parser = SseParser::default();
        assert!(parser.feed(&event[..split]).unwrap().is_empty());
        let events = parser.feed(&event[split..]).unwrap();
        assert_eq!(events, vec![SseEvent::Data("h\u{e9}llo \u{65e5}\u{672c}".to_string())]);
    }

    #[test]
    fn sse_parser_joins_crlf_split_across_reads() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"data: x\r\n\r").unwrap().is_empty());
        assert_eq!(
            parser.feed(b"\n").unwrap(),
            vec![SseEvent::Data("x".to_string())]
        );
        assert!(!parser.has_pending());
    }

    #[test]
    fn sse_parser_rejects_invalid_utf8() {
        let mut parser = SseParser::default();
        assert!(matches!(
            parser.feed(b"data: \xff\xfe\n\n"),
            Err(CompletionError::MalformedResponse(_))
        ));
    }

    async fn pump_reads(reads: Vec<Vec<u8>>) -> Vec<Result<StreamChunk, CompletionError>> {
        let (tx, mut rx) = mpsc::channel(64);
        let body = futures::stream::iter(reads.into_iter().map(Ok::<_, std::io::Error>));
        pump_events(body, tx).await;

        let mut received = Vec::new();
        while let Some(item) = rx.recv().await {
            received.push(item);
        }
        received
    }

    #[tokio::test]
    async fn byte_at_a_time_stream_yields_the_full_text() {
        let payload = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"h\u{e9}llo \"}}]}\r\n\r\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"\u{65e5}\u{672c}\"}}]}\r\n\r\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2,\"total_tokens\":6}}\r\n\r\n",
            "data: [DONE]\r\n\r\n",
        );
        let reads = payload.as_bytes().chunks(1).map(<[u8]>::to_vec).collect();

        let chunks: Vec<StreamChunk> = pump_reads(reads)
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();

        let text: String = chunks.iter().filter_map(|c| c.delta.as_deref()).collect();
        assert_eq!(text, "h\u{e9}llo \u{65e5}\u{672c}");
        assert_eq!(chunks.last().and_then(|c| c.usage.as_ref()).map(|u| u.total_tokens), Some(6));
    }

    #[tokio::test]
    async fn stream_cut_mid_event_is_a_transport_failure() {
        let received = pump_reads(vec![b"data: {\"choices\":".to_vec()]).await;
        assert!(matches!(
            received.as_slice(),
            [Err(CompletionError::TransportFailure(_))]
        ));
    }

    #[test]
    fn chunk_with_empty_choices_carries_usage() {
        let chunk = parse_chunk(
            r#"{"choices":[],"usage":{"prompt_tokens":9,"completion_tokens":3,"total_tokens":12}}"#,
        )
        .unwrap();
        assert_eq!(chunk.delta, None);
        assert_eq!(chunk.usage.map(|u| u.total_tokens), Some(12));

        let chunk = parse_chunk(r#"{"choices":[{"delta":{"content":"Hi"}}],"usage":null}"#).unwrap();
        assert_eq!(chunk.delta.as_deref(), Some("Hi"));
    }

    #[test]
    fn bad_chunk_is_malformed() {
        assert!(matches!(
            parse_chunk("not json"),
            Err(CompletionError::MalformedResponse(_))
        ));
    }

    #[test]
    fn image_message_serializes_as_parts() {
        let message = Message::new(
            MessageId(3),
            Role::User,
            MessageContent::TextWithImage {
                text: "what is this?".to_string(),
                image: ImageRef::new("AAAA", DetailLevel::High),
            },
        );
        let json = serde_json::to_value(WireMessage::from(&message)).unwrap();

        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][0]["text"], "what is this?");
        assert_eq!(json["content"][1]["type"], "image_url");
        assert_eq!(
            json["content"][1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );
        assert_eq!(json["content"][1]["image_url"]["detail"], "high");
    }

    #[test]
    fn empty_content_becomes_apology_and_missing_choices_is_malformed() {
        let parsed: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":null}}],"usage":{"prompt_tokens":5,"completion_tokens":0,"total_tokens":5}}"#,
        )
        .unwrap();
        assert_eq!(parsed.into_result().unwrap(), CompletionResult::apology());

        let parsed: ChatCompletionResponse = serde_json::from_str(r#"{"id":"x"}"#).unwrap();
        assert!(matches!(
            parsed.into_result(),
            Err(CompletionError::MalformedResponse(_))
        ));
    }
}

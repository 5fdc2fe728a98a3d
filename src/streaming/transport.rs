//! Transport boundary for the cloud transcription collaborator.
//!
//! The bridge only knows the `TranscriptionTransport` trait:
//! open(config) → a sink for role-tagged audio plus a source of
//! transcript events. The WebSocket implementation below speaks the
//! relay gateway's framing (JSON control/text frames, role-tagged
//! binary PCM); the vendor protocol behind the gateway is not this
//! crate's business.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::StreamError;
use crate::events::{Role, TranscriptEvent, WordTiming};

/// Last known streaming configuration; reused verbatim for the
/// bridge's automatic restart.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub language: String,
    pub interim_results: bool,
    pub sample_rate: u32,
}

/// Outbound half of a streaming connection.
#[async_trait]
pub trait TranscriptionSink: Send {
    async fn send_audio(&mut self, role: Role, samples: &[f32]) -> Result<(), StreamError>;
    async fn close(&mut self);
}

/// Inbound half of a streaming connection. `None` means the provider
/// closed the stream.
#[async_trait]
pub trait TranscriptionSource: Send {
    async fn next_event(&mut self) -> Option<Result<TranscriptEvent, StreamError>>;
}

/// Factory for streaming connections. The bridge calls `open` once at
/// start and once more for its single automatic restart.
#[async_trait]
pub trait TranscriptionTransport: Send + Sync {
    async fn open(
        &self,
        config: &StreamConfig,
    ) -> Result<(Box<dyn TranscriptionSink>, Box<dyn TranscriptionSource>), StreamError>;
}

/* ---------------- gateway wire messages ---------------- */

#[derive(Serialize)]
struct StartMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    language: &'a str,
    interim_results: bool,
    sample_rate: u32,
    encoding: &'static str,
    channels: [&'static str; 2],
}

#[derive(Serialize)]
struct StopMessage {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct GatewayWord {
    word: String,
    start_ms: u32,
    end_ms: u32,
}

#[derive(Deserialize)]
struct GatewayMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<u8>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    is_final: Option<bool>,
    #[serde(default)]
    words: Option<Vec<GatewayWord>>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Interpret one gateway text frame. `None` means "nothing for the
/// caller" (keepalives, acks, empty or unroutable transcripts).
fn parse_text_message(text: &str) -> Option<Result<TranscriptEvent, StreamError>> {
    let msg: GatewayMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            // One malformed frame is not worth killing the stream.
            debug!("ignoring unparseable gateway frame: {}", e);
            return None;
        }
    };

    match msg.kind.as_str() {
        "transcript" => {
            let role = msg.channel.and_then(Role::from_channel_index)?;
            let text = msg.text.unwrap_or_default();
            if text.is_empty() {
                return None;
            }
            let words = msg.words.map(|words| {
                words
                    .into_iter()
                    .map(|w| WordTiming {
                        word: w.word,
                        start_ms: w.start_ms,
                        end_ms: w.end_ms,
                    })
                    .collect()
            });
            Some(Ok(TranscriptEvent {
                role,
                text,
                is_final: msg.is_final.unwrap_or(false),
                words,
                timestamp: Utc::now(),
            }))
        }
        "error" => {
            let detail = msg.message.unwrap_or_else(|| "gateway error".to_string());
            let err = match msg.code.as_deref() {
                Some("auth") | Some("unauthorized") => StreamError::Auth(detail),
                Some("rate_limit") => StreamError::RateLimited(detail),
                _ => StreamError::ConnectionLost(detail),
            };
            Some(Err(err))
        }
        other => {
            debug!("ignoring gateway frame of type '{}'", other);
            None
        }
    }
}

/* ---------------- websocket implementation ---------------- */

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the relay gateway over a WebSocket.
pub struct WebSocketTransport {
    url: String,
    api_key: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl TranscriptionTransport for WebSocketTransport {
    async fn open(
        &self,
        config: &StreamConfig,
    ) -> Result<(Box<dyn TranscriptionSink>, Box<dyn TranscriptionSource>), StreamError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        if !self.api_key.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|e| StreamError::Connect(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        debug!("connecting to transcription gateway at {}", self.url);
        let (ws, _response) = connect_async(request).await.map_err(map_connect_error)?;
        let (mut sink, source) = ws.split();

        let start = StartMessage {
            kind: "start",
            language: &config.language,
            interim_results: config.interim_results,
            sample_rate: config.sample_rate,
            encoding: "pcm_s16le",
            channels: [Role::Candidate.label(), Role::OtherParty.label()],
        };
        let payload =
            serde_json::to_string(&start).map_err(|e| StreamError::Connect(e.to_string()))?;
        sink.send(Message::Text(payload))
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        info!(
            "transcription stream open (language {}, interim {})",
            config.language, config.interim_results
        );

        Ok((
            Box::new(WebSocketSink { sink }),
            Box::new(WebSocketSource { stream: source }),
        ))
    }
}

fn map_connect_error(e: tungstenite::Error) -> StreamError {
    match &e {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                StreamError::Auth(format!("gateway returned {}", status))
            } else if status.as_u16() == 429 {
                StreamError::RateLimited(format!("gateway returned {}", status))
            } else {
                StreamError::Connect(e.to_string())
            }
        }
        _ => StreamError::Connect(e.to_string()),
    }
}

struct WebSocketSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TranscriptionSink for WebSocketSink {
    async fn send_audio(&mut self, role: Role, samples: &[f32]) -> Result<(), StreamError> {
        // One byte of channel routing, then little-endian 16-bit PCM.
        let mut payload = Vec::with_capacity(1 + samples.len() * 2);
        payload.push(role.channel_index());
        payload.extend_from_slice(&crate::audio_toolkit::utils::samples_to_pcm16(samples));

        self.sink
            .send(Message::Binary(payload))
            .await
            .map_err(|e| StreamError::ConnectionLost(e.to_string()))
    }

    async fn close(&mut self) {
        if let Ok(stop) = serde_json::to_string(&StopMessage { kind: "stop" }) {
            let _ = self.sink.send(Message::Text(stop)).await;
        }
        if let Err(e) = self.sink.close().await {
            debug!("websocket close: {}", e);
        }
    }
}

struct WebSocketSource {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl TranscriptionSource for WebSocketSource {
    async fn next_event(&mut self) -> Option<Result<TranscriptEvent, StreamError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    if let Some(event) = parse_text_message(&text) {
                        return Some(event);
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!("gateway closed the stream: {:?}", frame);
                    return None;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(other) => {
                    debug!("ignoring non-text gateway message: {:?}", other);
                }
                Err(e) => {
                    warn!("websocket receive error: {}", e);
                    return Some(Err(StreamError::ConnectionLost(e.to_string())));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transcript_frames() {
        let frame = r#"{"type":"transcript","channel":1,"text":"hello there","is_final":true,
            "words":[{"word":"hello","start_ms":0,"end_ms":300}]}"#;
        let event = parse_text_message(frame).unwrap().unwrap();
        assert_eq!(event.role, Role::OtherParty);
        assert_eq!(event.text, "hello there");
        assert!(event.is_final);
        assert_eq!(event.words.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn skips_empty_and_unroutable_transcripts() {
        assert!(parse_text_message(r#"{"type":"transcript","channel":0,"text":""}"#).is_none());
        assert!(parse_text_message(r#"{"type":"transcript","channel":9,"text":"hi"}"#).is_none());
        assert!(parse_text_message(r#"{"type":"keepalive"}"#).is_none());
        assert!(parse_text_message("not json").is_none());
    }

    #[test]
    fn maps_gateway_errors_onto_the_taxonomy() {
        let auth = parse_text_message(r#"{"type":"error","code":"auth","message":"bad key"}"#)
            .unwrap()
            .unwrap_err();
        assert!(auth.is_credential_error());

        let lost = parse_text_message(r#"{"type":"error","message":"shard moved"}"#)
            .unwrap()
            .unwrap_err();
        assert!(matches!(lost, StreamError::ConnectionLost(_)));
    }
}

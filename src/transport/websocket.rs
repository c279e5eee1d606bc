//! WebSocket connector for OpenAI-compatible realtime endpoints

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use base64::Engine;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{InboundEvent, InboundSink, OutboundMessage, PeerConnection, PeerConnector};
use crate::voice::{AudioFrames, AudioOutput, to_pcm16};
use crate::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a realtime endpoint over WebSocket
///
/// Microphone frames are streamed upstream as base64 PCM16 and remote audio
/// deltas are played through the configured [`AudioOutput`].
pub struct WebSocketConnector {
    url: String,
    model: String,
    output: Option<Arc<dyn AudioOutput>>,
}

impl WebSocketConnector {
    /// Create a connector for `url` and `model`
    #[must_use]
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            model: model.into(),
            output: None,
        }
    }

    /// Play remote audio through `output`
    #[must_use]
    pub fn with_output(mut self, output: Arc<dyn AudioOutput>) -> Self {
        self.output = Some(output);
        self
    }

    fn endpoint(&self) -> Result<url::Url> {
        let mut endpoint = url::Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("invalid realtime url: {e}")))?;
        if !endpoint.query_pairs().any(|(k, _)| k == "model") {
            endpoint.query_pairs_mut().append_pair("model", &self.model);
        }
        Ok(endpoint)
    }
}

#[async_trait]
impl PeerConnector for WebSocketConnector {
    async fn negotiate(
        &self,
        credential: &SecretString,
        microphone: AudioFrames,
        inbound: InboundSink,
    ) -> Result<Box<dyn PeerConnection>> {
        let endpoint = self.endpoint()?;
        let mut request = endpoint.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.expose_secret()))
            .map_err(|e| Error::ConnectionFailed(format!("invalid credential: {e}")))?;
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        tracing::debug!(host = ?endpoint.host_str(), "opening realtime websocket");
        let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
        let (write, mut read) = socket.split();

        await_session_created(&mut read).await?;
        tracing::info!(generation = inbound.generation(), "realtime session established");

        let open = Arc::new(AtomicBool::new(true));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_writer(
            write,
            outbound_rx,
            microphone,
            Arc::clone(&open),
            inbound.clone(),
        ));
        let reader = tokio::spawn(run_reader(
            read,
            inbound,
            self.output.clone(),
            Arc::clone(&open),
        ));

        Ok(Box::new(WebSocketConnection {
            outbound: Some(outbound_tx),
            open,
            reader: Some(reader),
            output: self.output.clone(),
        }))
    }
}

async fn await_session_created(read: &mut SplitStream<Socket>) -> Result<()> {
    while let Some(message) = read.next().await {
        let Message::Text(text) = message? else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        match value.get("type").and_then(Value::as_str) {
            Some("session.created") => return Ok(()),
            Some("error") => {
                let event = error_event(&value);
                let fatal = event.is_fatal_error();
                let message = match event {
                    InboundEvent::Error { message, .. } => message,
                    _ => "negotiation error".to_string(),
                };
                return Err(if fatal {
                    Error::FatalTransport(message)
                } else {
                    Error::ConnectionFailed(message)
                });
            }
            _ => {}
        }
    }
    Err(Error::ConnectionFailed(
        "socket closed during negotiation".to_string(),
    ))
}

struct WebSocketConnection {
    outbound: Option<mpsc::UnboundedSender<Value>>,
    open: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    output: Option<Arc<dyn AudioOutput>>,
}

impl PeerConnection for WebSocketConnection {
    fn send(&mut self, message: &OutboundMessage) -> bool {
        if !self.is_open() {
            return false;
        }
        self.outbound
            .as_ref()
            .is_some_and(|tx| tx.send(message.to_wire()).is_ok())
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        // Dropping the sender lets the writer send a close frame and exit
        self.outbound = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(output) = &self.output {
            output.clear();
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_writer(
    mut write: SplitSink<Socket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Value>,
    mut microphone: AudioFrames,
    open: Arc<AtomicBool>,
    inbound: InboundSink,
) {
    let mut microphone_live = true;

    loop {
        let payload = tokio::select! {
            message = outbound.recv() => match message {
                Some(value) => value,
                None => break,
            },
            frame = microphone.recv(), if microphone_live => match frame {
                Some(frame) => audio_append(&frame),
                None => {
                    tracing::debug!("microphone stream ended");
                    microphone_live = false;
                    continue;
                }
            },
        };

        if let Err(e) = write.send(Message::text(payload.to_string())).await {
            tracing::warn!(error = %e, "realtime websocket write failed");
            if open.swap(false, Ordering::SeqCst) {
                inbound.emit(InboundEvent::ConnectionFailed {
                    reason: Some(e.to_string()),
                });
            }
            return;
        }
    }

    let _ = write.send(Message::Close(None)).await;
    let _ = write.close().await;
}

async fn run_reader(
    mut read: SplitStream<Socket>,
    inbound: InboundSink,
    output: Option<Arc<dyn AudioOutput>>,
    open: Arc<AtomicBool>,
) {
    let mut mapper = RemoteEventMapper::default();

    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
                    tracing::warn!("unparseable realtime event");
                    continue;
                };
                if let (Some(output), Some(samples)) = (output.as_ref(), decode_audio_delta(&value)) {
                    output.push_pcm16(&samples);
                }
                if let Some(event) = mapper.map(&value) {
                    if !inbound.emit(event) {
                        return;
                    }
                }
            }
            Ok(Message::Close(frame)) => {
                tracing::debug!(?frame, "realtime websocket closed by remote");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "realtime websocket read failed");
                break;
            }
        }
    }

    if open.swap(false, Ordering::SeqCst) {
        inbound.emit(InboundEvent::ConnectionFailed {
            reason: Some("remote closed the connection".to_string()),
        });
    }
}

/// Maps the remote endpoint's native events onto [`InboundEvent`]
#[derive(Debug, Default)]
pub struct RemoteEventMapper {
    audio_active: bool,
    call_names: HashMap<String, String>,
}

impl RemoteEventMapper {
    /// Translate one remote event; `None` for events the session ignores
    pub fn map(&mut self, value: &Value) -> Option<InboundEvent> {
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        let text = |field: &str| value.get(field).and_then(Value::as_str).map(str::to_string);

        match kind {
            "input_audio_buffer.speech_started" => Some(InboundEvent::SpeechStarted),
            "input_audio_buffer.speech_stopped" => Some(InboundEvent::SpeechStopped),
            "conversation.item.input_audio_transcription.delta" => {
                Some(InboundEvent::TranscriptDelta {
                    delta: text("delta").unwrap_or_default(),
                })
            }
            "conversation.item.input_audio_transcription.completed" => {
                Some(InboundEvent::TranscriptCompleted {
                    transcript: text("transcript").unwrap_or_default(),
                })
            }
            "conversation.item.input_audio_transcription.failed" => {
                Some(InboundEvent::TranscriptFailed {
                    error: value
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
            }
            "response.output_item.added" => {
                let item = value.get("item")?;
                if item.get("type").and_then(Value::as_str) == Some("function_call") {
                    let call_id = item.get("call_id").and_then(Value::as_str)?;
                    let name = item.get("name").and_then(Value::as_str)?;
                    self.call_names.insert(call_id.to_string(), name.to_string());
                }
                None
            }
            "response.function_call_arguments.delta" => {
                let call_id = text("call_id")?;
                Some(InboundEvent::FunctionCallDelta {
                    name: self.call_names.get(&call_id).cloned(),
                    delta: text("delta").unwrap_or_default(),
                    call_id,
                })
            }
            "response.function_call_arguments.done" => {
                let call_id = text("call_id")?;
                let remembered = self.call_names.remove(&call_id);
                Some(InboundEvent::FunctionCallCompleted {
                    name: text("name").or(remembered),
                    arguments: text("arguments"),
                    call_id,
                })
            }
            "response.audio.delta" | "output_audio_buffer.started" => {
                if self.audio_active {
                    None
                } else {
                    self.audio_active = true;
                    Some(InboundEvent::AudioStarted)
                }
            }
            "response.audio.done"
            | "response.done"
            | "output_audio_buffer.stopped"
            | "output_audio_buffer.cleared" => {
                if self.audio_active {
                    self.audio_active = false;
                    Some(InboundEvent::AudioStopped)
                } else {
                    None
                }
            }
            "error" => Some(error_event(value)),
            other => {
                tracing::trace!(kind = other, "unmapped realtime event");
                None
            }
        }
    }
}

fn error_event(value: &Value) -> InboundEvent {
    let field = |name: &str| {
        value
            .get("error")
            .and_then(|e| e.get(name))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    InboundEvent::Error {
        code: field("code"),
        message: field("message").unwrap_or_else(|| "realtime error".to_string()),
    }
}

/// Decode the PCM16 payload of an audio delta event
fn decode_audio_delta(value: &Value) -> Option<Vec<i16>> {
    if value.get("type").and_then(Value::as_str) != Some("response.audio.delta") {
        return None;
    }
    let encoded = value.get("delta").and_then(Value::as_str)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    Some(
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
    )
}

/// Wrap a microphone frame as an input buffer append
fn audio_append(frame: &[f32]) -> Value {
    let bytes: Vec<u8> = frame
        .iter()
        .flat_map(|&sample| to_pcm16(sample).to_le_bytes())
        .collect();
    json!({
        "type": "input_audio_buffer.append",
        "audio": base64::engine::general_purpose::STANDARD.encode(bytes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_function_call_stream() {
        let mut mapper = RemoteEventMapper::default();

        assert!(
            mapper
                .map(&json!({
                    "type": "response.output_item.added",
                    "item": {"type": "function_call", "call_id": "c1", "name": "search_drinks"},
                }))
                .is_none()
        );

        let delta = mapper.map(&json!({
            "type": "response.function_call_arguments.delta",
            "call_id": "c1",
            "delta": "{\"query\":",
        }));
        assert_eq!(
            delta,
            Some(InboundEvent::FunctionCallDelta {
                call_id: "c1".to_string(),
                name: Some("search_drinks".to_string()),
                delta: "{\"query\":".to_string(),
            })
        );

        let done = mapper.map(&json!({
            "type": "response.function_call_arguments.done",
            "call_id": "c1",
            "arguments": "{\"query\":\"ipa\"}",
        }));
        assert_eq!(
            done,
            Some(InboundEvent::FunctionCallCompleted {
                call_id: "c1".to_string(),
                name: Some("search_drinks".to_string()),
                arguments: Some("{\"query\":\"ipa\"}".to_string()),
            })
        );
    }

    #[test]
    fn audio_start_and_stop_fire_once() {
        let mut mapper = RemoteEventMapper::default();
        let delta = json!({"type": "response.audio.delta", "delta": ""});

        assert_eq!(mapper.map(&delta), Some(InboundEvent::AudioStarted));
        assert_eq!(mapper.map(&delta), None);
        assert_eq!(
            mapper.map(&json!({"type": "response.audio.done"})),
            Some(InboundEvent::AudioStopped)
        );
        assert_eq!(mapper.map(&json!({"type": "response.done"})), None);
    }

    #[test]
    fn maps_transcripts_and_errors() {
        let mut mapper = RemoteEventMapper::default();

        assert_eq!(
            mapper.map(&json!({
                "type": "conversation.item.input_audio_transcription.completed",
                "transcript": "that's all",
            })),
            Some(InboundEvent::TranscriptCompleted {
                transcript: "that's all".to_string()
            })
        );

        let error = mapper
            .map(&json!({
                "type": "error",
                "error": {"code": "session_expired", "message": "expired"},
            }))
            .unwrap();
        assert!(error.is_fatal_error());

        assert!(mapper.map(&json!({"type": "rate_limits.updated"})).is_none());
    }

    #[test]
    fn audio_delta_decodes_little_endian() {
        let bytes = [0x01u8, 0x00, 0xff, 0x7f];
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        let samples =
            decode_audio_delta(&json!({"type": "response.audio.delta", "delta": encoded})).unwrap();
        assert_eq!(samples, vec![1, i16::MAX]);
    }

    #[test]
    fn microphone_frame_encodes_as_append() {
        let value = audio_append(&[0.0, 1.0]);
        assert_eq!(value["type"], "input_audio_buffer.append");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(value["audio"].as_str().unwrap())
            .unwrap();
        assert_eq!(bytes.len(), 4);
    }

    #[test]
    fn endpoint_appends_model() {
        let connector = WebSocketConnector::new("wss://api.openai.com/v1/realtime", "gpt-realtime");
        let endpoint = connector.endpoint().unwrap();
        assert_eq!(endpoint.query(), Some("model=gpt-realtime"));
    }
}

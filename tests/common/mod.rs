//! Shared test utilities
//!
//! In-memory stand-ins for every capability the session controller uses.
//! Each fake hands out a probe so tests can inject callbacks and inspect
//! what the controller did.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use venue_voice::bridge::{CartPublisher, CartUpdateNotification};
use venue_voice::config::Config;
use venue_voice::session::{SessionComponents, SessionController, SessionHandle};
use venue_voice::tools::ToolDispatcher;
use venue_voice::transport::{
    CredentialProvider, InboundEvent, InboundSink, OutboundMessage, PeerConnection, PeerConnector,
    StaticCredential,
};
use venue_voice::voice::{
    AudioFrames, MicrophoneLease, MicrophoneSource, RecognitionError, RecognizerEvent,
    RecognizerSink, SpeechRecognizer, SpeechSynthesizer,
};
use venue_voice::{Error, Result};

// --- Recognizer ---

#[derive(Default)]
struct RecognizerState {
    sink: Option<RecognizerSink>,
    /// Sink of the previous run, kept to replay late callbacks
    previous: Option<RecognizerSink>,
    starts: usize,
    stops: usize,
    deny: bool,
}

/// Recognizer driven by its probe
pub struct FakeRecognizer {
    state: Arc<Mutex<RecognizerState>>,
}

/// Test side of a [`FakeRecognizer`]
#[derive(Clone)]
pub struct RecognizerProbe {
    state: Arc<Mutex<RecognizerState>>,
}

impl FakeRecognizer {
    pub fn new() -> (Self, RecognizerProbe) {
        let state = Arc::new(Mutex::new(RecognizerState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            RecognizerProbe { state },
        )
    }
}

impl SpeechRecognizer for FakeRecognizer {
    fn start(&mut self, sink: RecognizerSink) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.deny {
            return Err(Error::PermissionDenied("speech recognition refused".into()));
        }
        state.starts += 1;
        state.sink = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.lock().unwrap();
        if let Some(sink) = state.sink.take() {
            state.stops += 1;
            state.previous = Some(sink);
        }
    }
}

impl RecognizerProbe {
    /// Deliver a final transcript to the current run
    pub fn say(&self, transcript: &str) -> bool {
        self.emit(RecognizerEvent::Result {
            transcript: transcript.to_string(),
            is_final: true,
        })
    }

    /// End the current run on its own
    pub fn end(&self) -> bool {
        let sink = self.state.lock().unwrap().sink.take();
        sink.is_some_and(|s| s.emit(RecognizerEvent::End))
    }

    pub fn fail(&self, error: RecognitionError) -> bool {
        self.emit(RecognizerEvent::Error(error))
    }

    /// Deliver a transcript through the last stopped run's sink
    pub fn say_late(&self, transcript: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.previous.as_ref().is_some_and(|s| {
            s.emit(RecognizerEvent::Result {
                transcript: transcript.to_string(),
                is_final: true,
            })
        })
    }

    pub fn deny(&self) {
        self.state.lock().unwrap().deny = true;
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().sink.is_some()
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub fn stops(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    fn emit(&self, event: RecognizerEvent) -> bool {
        let state = self.state.lock().unwrap();
        state.sink.as_ref().is_some_and(|s| s.emit(event))
    }
}

// --- Microphone ---

/// Microphone that tracks its single lease
#[derive(Default)]
pub struct FakeMicrophone {
    held: Arc<AtomicBool>,
    opens: AtomicUsize,
    deny: AtomicBool,
}

impl FakeMicrophone {
    pub fn deny(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl MicrophoneSource for FakeMicrophone {
    fn open(&self) -> Result<MicrophoneLease> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(Error::PermissionDenied("microphone access refused".into()));
        }
        if self.held.swap(true, Ordering::SeqCst) {
            return Err(Error::Audio("microphone already in use".into()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (_tx, rx): (_, AudioFrames) = mpsc::channel(8);
        let held = Arc::clone(&self.held);
        Ok(MicrophoneLease::new(rx, move || {
            held.store(false, Ordering::SeqCst);
        }))
    }
}

// --- Connector ---

/// How the next negotiation behaves
#[derive(Debug, Clone)]
pub enum ConnectBehavior {
    Succeed,
    Fail(String),
    Fatal(String),
    /// Never completes; only the connect timeout ends it
    Hang,
}

#[derive(Default)]
struct ConnectorState {
    inbound: Option<InboundSink>,
    sent: Vec<OutboundMessage>,
    negotiations: usize,
    closes: usize,
    open: bool,
}

/// Connector producing in-memory connections
pub struct FakeConnector {
    behavior: Mutex<ConnectBehavior>,
    state: Arc<Mutex<ConnectorState>>,
}

/// Test side of a [`FakeConnector`]
#[derive(Clone)]
pub struct ConnectionProbe {
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    pub fn new() -> (Self, ConnectionProbe) {
        let state = Arc::new(Mutex::new(ConnectorState::default()));
        (
            Self {
                behavior: Mutex::new(ConnectBehavior::Succeed),
                state: Arc::clone(&state),
            },
            ConnectionProbe { state },
        )
    }

    pub fn set_behavior(&self, behavior: ConnectBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn negotiate(
        &self,
        _credential: &SecretString,
        _microphone: AudioFrames,
        inbound: InboundSink,
    ) -> Result<Box<dyn PeerConnection>> {
        let behavior = self.behavior.lock().unwrap().clone();
        self.state.lock().unwrap().negotiations += 1;
        match behavior {
            ConnectBehavior::Succeed => {
                let mut state = self.state.lock().unwrap();
                state.inbound = Some(inbound);
                state.open = true;
                Ok(Box::new(FakeConnection {
                    state: Arc::clone(&self.state),
                    open: true,
                }))
            }
            ConnectBehavior::Fail(reason) => Err(Error::ConnectionFailed(reason)),
            ConnectBehavior::Fatal(reason) => Err(Error::FatalTransport(reason)),
            ConnectBehavior::Hang => std::future::pending().await,
        }
    }
}

struct FakeConnection {
    state: Arc<Mutex<ConnectorState>>,
    open: bool,
}

impl PeerConnection for FakeConnection {
    fn send(&mut self, message: &OutboundMessage) -> bool {
        if !self.open {
            return false;
        }
        self.state.lock().unwrap().sent.push(message.clone());
        true
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            let mut state = self.state.lock().unwrap();
            state.open = false;
            state.closes += 1;
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl ConnectionProbe {
    /// Deliver an inbound event on the latest connection
    pub fn emit(&self, event: InboundEvent) -> bool {
        let state = self.state.lock().unwrap();
        state.inbound.as_ref().is_some_and(|s| s.emit(event))
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.state.lock().unwrap().sent.clear();
    }

    pub fn negotiations(&self) -> usize {
        self.state.lock().unwrap().negotiations
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    /// Outputs sent for tool calls, as `(call_id, output)`
    pub fn outputs(&self) -> Vec<(String, Value)> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                OutboundMessage::FunctionCallOutput { call_id, output } => {
                    Some((call_id, serde_json::from_str(&output).unwrap_or(Value::Null)))
                }
                _ => None,
            })
            .collect()
    }
}

// --- Synthesizer ---

/// Synthesizer that "speaks" for a fixed time
pub struct FakeSynthesizer {
    spoken: Mutex<Vec<String>>,
    cancels: AtomicUsize,
    duration: Duration,
}

impl FakeSynthesizer {
    pub fn new(duration: Duration) -> Self {
        Self {
            spoken: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
            duration,
        }
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn speak(&self, text: &str) -> Result<()> {
        self.spoken.lock().unwrap().push(text.to_string());
        tokio::time::sleep(self.duration).await;
        Ok(())
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

// --- Tools ---

/// Dispatcher answering from a table, optionally after a delay
#[derive(Default)]
pub struct FakeDispatcher {
    responses: Mutex<HashMap<String, std::result::Result<Value, String>>>,
    calls: Mutex<Vec<(String, Value)>>,
    delay: Mutex<Duration>,
}

impl FakeDispatcher {
    pub fn respond(&self, tool: &str, response: std::result::Result<Value, String>) {
        self.responses
            .lock()
            .unwrap()
            .insert(tool.to_string(), response);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolDispatcher for FakeDispatcher {
    async fn dispatch(&self, name: &str, arguments: Value) -> Result<Value> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments));
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        let response = self.responses.lock().unwrap().get(name).cloned();
        match response {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(Error::ToolDispatch(message)),
            None => Ok(serde_json::json!({ "success": true })),
        }
    }
}

/// Publisher collecting notifications
#[derive(Default)]
pub struct FakePublisher {
    published: Mutex<Vec<CartUpdateNotification>>,
}

impl FakePublisher {
    pub fn published(&self) -> Vec<CartUpdateNotification> {
        self.published.lock().unwrap().clone()
    }
}

impl CartPublisher for FakePublisher {
    fn publish(&self, notification: CartUpdateNotification) {
        self.published.lock().unwrap().push(notification);
    }
}

// --- Harness ---

/// Configuration with a fixed client id
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.bridge.client_id = "test-client".to_string();
    config
}

// --- Credentials ---

/// Token endpoint that never answers
pub struct HangingCredential;

#[async_trait]
impl CredentialProvider for HangingCredential {
    async fn credential(&self) -> Result<SecretString> {
        std::future::pending().await
    }
}

/// A running controller plus probes for every fake
pub struct Harness {
    pub session: SessionHandle,
    pub recognizer: RecognizerProbe,
    pub microphone: Arc<FakeMicrophone>,
    pub connector: Arc<FakeConnector>,
    pub connection: ConnectionProbe,
    pub synthesizer: Arc<FakeSynthesizer>,
    pub dispatcher: Arc<FakeDispatcher>,
    pub publisher: Arc<FakePublisher>,
    pub task: JoinHandle<()>,
}

impl Harness {
    pub fn spawn() -> Self {
        Self::spawn_with(&test_config())
    }

    pub fn spawn_with(config: &Config) -> Self {
        let credentials: Arc<dyn CredentialProvider> =
            Arc::new(StaticCredential::new(SecretString::from("test-key".to_string())));
        Self::spawn_with_credentials(config, credentials)
    }

    pub fn spawn_with_credentials(config: &Config, credentials: Arc<dyn CredentialProvider>) -> Self {
        let (recognizer, recognizer_probe) = FakeRecognizer::new();
        let (connector, connection) = FakeConnector::new();
        let connector = Arc::new(connector);
        let microphone = Arc::new(FakeMicrophone::default());
        let synthesizer = Arc::new(FakeSynthesizer::new(Duration::from_millis(800)));
        let dispatcher = Arc::new(FakeDispatcher::default());
        let publisher = Arc::new(FakePublisher::default());

        let components = SessionComponents {
            recognizer: Box::new(recognizer),
            microphone: Arc::clone(&microphone) as Arc<dyn MicrophoneSource>,
            connector: Arc::clone(&connector) as Arc<dyn PeerConnector>,
            credentials,
            synthesizer: Arc::clone(&synthesizer) as Arc<dyn SpeechSynthesizer>,
            dispatcher: Arc::clone(&dispatcher) as Arc<dyn ToolDispatcher>,
            publisher: Arc::clone(&publisher) as Arc<dyn CartPublisher>,
        };

        let (controller, session) = SessionController::new(config, components);
        let task = tokio::spawn(controller.run());

        Self {
            session,
            recognizer: recognizer_probe,
            microphone,
            connector,
            connection,
            synthesizer,
            dispatcher,
            publisher,
            task,
        }
    }
}

/// Poll `condition` until it holds, letting paused time advance
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

//! Realtime transport
//!
//! Owns the peer connection to the remote speech-to-speech model: opens the
//! microphone, negotiates the link through a [`PeerConnector`], and tags
//! every inbound event with the connection generation it came from so the
//! session can drop events from a link it has already torn down.

mod credential;
mod events;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::task::JoinHandle;

pub use credential::{CredentialProvider, HttpCredentialProvider, StaticCredential};
pub use events::{InboundEvent, OutboundMessage};
pub use websocket::{RemoteEventMapper, WebSocketConnector};

use crate::session::{EventSender, SessionEvent};
use crate::voice::{AudioFrames, MicrophoneLease, MicrophoneSource};
use crate::{Error, Result};

/// Where a connection delivers its inbound events
#[derive(Debug, Clone)]
pub struct InboundSink {
    tx: EventSender,
    generation: u64,
}

impl InboundSink {
    /// Bind a sink to a connection generation
    #[must_use]
    pub const fn new(tx: EventSender, generation: u64) -> Self {
        Self { tx, generation }
    }

    /// Connection this sink belongs to
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event; false once the session loop is gone
    pub fn emit(&self, event: InboundEvent) -> bool {
        self.tx
            .send(SessionEvent::Transport {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Establishes peer connections to the remote model
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Negotiate a link, resolving once it is established
    ///
    /// The connector streams `microphone` upstream and delivers remote
    /// events to `inbound` until closed.
    ///
    /// # Errors
    ///
    /// Returns error if negotiation fails
    async fn negotiate(
        &self,
        credential: &SecretString,
        microphone: AudioFrames,
        inbound: InboundSink,
    ) -> Result<Box<dyn PeerConnection>>;
}

/// An established link
pub trait PeerConnection: Send {
    /// Queue a message; false when the link is not open
    fn send(&mut self, message: &OutboundMessage) -> bool;

    /// Close the link; must be safe to call repeatedly
    fn close(&mut self);

    /// Whether messages can still be sent
    fn is_open(&self) -> bool;
}

/// Anything outbound messages can be written to
pub trait OutboundSink {
    /// Send a message; false when it could not be delivered
    fn send_message(&mut self, message: &OutboundMessage) -> bool;
}

/// A live connection plus the microphone it streams
///
/// Closing is idempotent and safe on a handle whose parts were never fully
/// set up.
pub struct ConnectionHandle {
    generation: u64,
    microphone: Option<MicrophoneLease>,
    peer: Option<Box<dyn PeerConnection>>,
}

impl ConnectionHandle {
    /// Assemble a handle
    #[must_use]
    pub fn new(
        generation: u64,
        microphone: Option<MicrophoneLease>,
        peer: Option<Box<dyn PeerConnection>>,
    ) -> Self {
        Self {
            generation,
            microphone,
            peer,
        }
    }

    /// Connection generation
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the link is open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.peer.as_ref().is_some_and(|p| p.is_open())
    }

    /// Send a message; returns false when the link is closed or gone
    pub fn send(&mut self, message: &OutboundMessage) -> bool {
        match self.peer.as_mut() {
            Some(peer) if peer.is_open() => {
                let sent = peer.send(message);
                if sent {
                    tracing::trace!(kind = message.kind(), "sent outbound message");
                } else {
                    tracing::warn!(kind = message.kind(), "outbound message dropped");
                }
                sent
            }
            _ => {
                tracing::debug!(kind = message.kind(), "link closed, message not sent");
                false
            }
        }
    }

    /// Close the link and release the microphone
    pub fn close(&mut self) {
        if let Some(mut peer) = self.peer.take() {
            peer.close();
            tracing::debug!(generation = self.generation, "connection closed");
        }
        if let Some(mut microphone) = self.microphone.take() {
            microphone.release();
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("generation", &self.generation)
            .field("open", &self.is_open())
            .field("microphone", &self.microphone.is_some())
            .finish()
    }
}

/// Manages connect attempts and the single live connection
pub struct RealtimeTransport {
    connector: Arc<dyn PeerConnector>,
    microphone: Arc<dyn MicrophoneSource>,
    credentials: Arc<dyn CredentialProvider>,
    events: EventSender,
    timeout: Duration,
    attempt: u64,
    pending: Option<JoinHandle<()>>,
    handle: Option<ConnectionHandle>,
}

impl RealtimeTransport {
    /// Create a transport; nothing connects until [`begin_connect`](Self::begin_connect)
    #[must_use]
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        microphone: Arc<dyn MicrophoneSource>,
        credentials: Arc<dyn CredentialProvider>,
        events: EventSender,
        timeout: Duration,
    ) -> Self {
        Self {
            connector,
            microphone,
            credentials,
            events,
            timeout,
            attempt: 0,
            pending: None,
            handle: None,
        }
    }

    /// Fetch a credential, acquire the microphone and establish a connection
    ///
    /// `timeout` bounds the whole attempt, credential fetch included.
    ///
    /// # Errors
    ///
    /// Returns `Error::PermissionDenied` if the microphone is refused,
    /// `Error::ConnectionTimeout` if the link is not established within
    /// `timeout`, or the credential provider's or connector's error
    pub async fn connect(
        connector: &dyn PeerConnector,
        microphone: &dyn MicrophoneSource,
        credentials: &dyn CredentialProvider,
        inbound: InboundSink,
        timeout: Duration,
    ) -> Result<ConnectionHandle> {
        let generation = inbound.generation();

        let attempt = async {
            let credential = credentials.credential().await?;
            let mut lease = microphone.open()?;
            let frames = lease
                .take_frames()
                .ok_or_else(|| Error::Audio("microphone lease has no frames".to_string()))?;
            let peer = connector.negotiate(&credential, frames, inbound).await?;
            Ok::<_, Error>(ConnectionHandle::new(generation, Some(lease), Some(peer)))
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(generation, timeout_ms = timeout.as_millis(), "connection timed out");
                Err(Error::ConnectionTimeout(timeout))
            }
        }
    }

    /// Start a connect attempt in the background
    ///
    /// The outcome arrives as [`SessionEvent::Connected`]. Returns the
    /// attempt number.
    pub fn begin_connect(&mut self) -> u64 {
        self.abort_pending();
        self.attempt += 1;
        let attempt = self.attempt;

        let connector = Arc::clone(&self.connector);
        let microphone = Arc::clone(&self.microphone);
        let credentials = Arc::clone(&self.credentials);
        let events = self.events.clone();
        let timeout = self.timeout;

        tracing::info!(attempt, "connecting to realtime endpoint");
        self.pending = Some(tokio::spawn(async move {
            let inbound = InboundSink::new(events.clone(), attempt);
            let result = Self::connect(
                connector.as_ref(),
                microphone.as_ref(),
                credentials.as_ref(),
                inbound,
                timeout,
            )
            .await;
            let _ = events.send(SessionEvent::Connected { attempt, result });
        }));
        attempt
    }

    /// Install the handle from a finished attempt
    ///
    /// A handle from a superseded attempt is closed and false is returned.
    pub fn accept(&mut self, attempt: u64, mut handle: ConnectionHandle) -> bool {
        self.pending = None;
        if attempt != self.attempt {
            tracing::debug!(attempt, current = self.attempt, "closing late connection");
            handle.close();
            return false;
        }
        if let Some(mut old) = self.handle.replace(handle) {
            old.close();
        }
        true
    }

    /// Whether `attempt` is the current one
    #[must_use]
    pub const fn is_current(&self, attempt: u64) -> bool {
        attempt == self.attempt
    }

    /// Whether `generation` belongs to the installed connection
    #[must_use]
    pub fn is_live_generation(&self, generation: u64) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| h.generation() == generation)
    }

    /// Whether a connection is installed
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// Send on the live connection; false if there is none or it is closed
    pub fn send(&mut self, message: &OutboundMessage) -> bool {
        match self.handle.as_mut() {
            Some(handle) => handle.send(message),
            None => {
                tracing::debug!(kind = message.kind(), "no connection, message not sent");
                false
            }
        }
    }

    /// Abort any in-flight attempt and close the live connection
    pub fn close(&mut self) {
        if self.abort_pending() {
            // Invalidate whatever the aborted attempt may still post
            self.attempt += 1;
        }
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
    }

    fn abort_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl OutboundSink for RealtimeTransport {
    fn send_message(&mut self, message: &OutboundMessage) -> bool {
        self.send(message)
    }
}

impl Drop for RealtimeTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    use super::*;

    struct CountingMic {
        opened: AtomicUsize,
        released: Arc<AtomicUsize>,
        deny: bool,
    }

    impl CountingMic {
        fn new(deny: bool) -> Self {
            Self {
                opened: AtomicUsize::new(0),
                released: Arc::new(AtomicUsize::new(0)),
                deny,
            }
        }
    }

    impl MicrophoneSource for CountingMic {
        fn open(&self) -> Result<MicrophoneLease> {
            if self.deny {
                return Err(Error::PermissionDenied("denied".into()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            let released = Arc::clone(&self.released);
            let (_tx, rx) = mpsc::channel(1);
            Ok(MicrophoneLease::new(rx, move || {
                released.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    struct RecordingPeer {
        open: bool,
        sent: Arc<Mutex<Vec<OutboundMessage>>>,
    }

    impl PeerConnection for RecordingPeer {
        fn send(&mut self, message: &OutboundMessage) -> bool {
            self.sent.lock().unwrap().push(message.clone());
            true
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    enum Behavior {
        Succeed,
        Hang,
    }

    struct ScriptedConnector {
        behavior: Behavior,
        sent: Arc<Mutex<Vec<OutboundMessage>>>,
    }

    #[async_trait]
    impl PeerConnector for ScriptedConnector {
        async fn negotiate(
            &self,
            _credential: &SecretString,
            _microphone: AudioFrames,
            _inbound: InboundSink,
        ) -> Result<Box<dyn PeerConnection>> {
            match self.behavior {
                Behavior::Succeed => Ok(Box::new(RecordingPeer {
                    open: true,
                    sent: Arc::clone(&self.sent),
                })),
                Behavior::Hang => std::future::pending().await,
            }
        }
    }

    fn connector(behavior: Behavior) -> ScriptedConnector {
        ScriptedConnector {
            behavior,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn sink() -> InboundSink {
        let (tx, _rx) = mpsc::unbounded_channel();
        InboundSink::new(tx, 1)
    }

    fn key() -> SecretString {
        SecretString::from("sk-test".to_string())
    }

    #[tokio::test]
    async fn connect_then_close_is_idempotent() {
        let mic = CountingMic::new(false);
        let connector = connector(Behavior::Succeed);

        let mut handle = RealtimeTransport::connect(
            &connector,
            &mic,
            &StaticCredential::new(key()),
            sink(),
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert!(handle.is_open());
        assert!(handle.send(&OutboundMessage::ResponseCreate { instructions: None }));

        handle.close();
        handle.close();
        assert!(!handle.is_open());
        assert!(!handle.send(&OutboundMessage::ResponseCreate { instructions: None }));
        assert_eq!(mic.released.load(Ordering::SeqCst), 1);
        assert_eq!(connector.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_and_releases_microphone() {
        let mic = CountingMic::new(false);
        let connector = connector(Behavior::Hang);

        let result = RealtimeTransport::connect(
            &connector,
            &mic,
            &StaticCredential::new(key()),
            sink(),
            Duration::from_secs(10),
        )
        .await;

        assert!(matches!(result, Err(Error::ConnectionTimeout(_))));
        assert_eq!(mic.opened.load(Ordering::SeqCst), 1);
        assert_eq!(mic.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn microphone_denial_is_fatal() {
        let mic = CountingMic::new(true);
        let connector = connector(Behavior::Succeed);

        let err = RealtimeTransport::connect(
            &connector,
            &mic,
            &StaticCredential::new(key()),
            sink(),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();

        assert!(err.is_session_fatal());
    }

    #[test]
    fn empty_handle_close_is_safe() {
        let mut handle = ConnectionHandle::new(3, None, None);
        handle.close();
        assert!(!handle.is_open());
        assert!(!handle.send(&OutboundMessage::ResponseCreate { instructions: None }));
    }

    struct HangingCredential;

    #[async_trait]
    impl CredentialProvider for HangingCredential {
        async fn credential(&self) -> Result<SecretString> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_credential_fetch_times_out() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mic = Arc::new(CountingMic::new(false));
        let mut transport = RealtimeTransport::new(
            Arc::new(connector(Behavior::Succeed)),
            Arc::clone(&mic) as Arc<dyn MicrophoneSource>,
            Arc::new(HangingCredential),
            tx,
            Duration::from_secs(10),
        );

        let started = tokio::time::Instant::now();
        let attempt = transport.begin_connect();
        let outcome = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("connect attempt never finished");

        let Some(SessionEvent::Connected { attempt: done, result }) = outcome else {
            panic!("expected connect outcome");
        };
        assert_eq!(done, attempt);
        assert!(matches!(result, Err(Error::ConnectionTimeout(_))));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(11));
        // The microphone is never touched without a credential
        assert_eq!(mic.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn late_attempt_is_closed_on_accept() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mic = Arc::new(CountingMic::new(false));
        let released = Arc::clone(&mic.released);
        let mut transport = RealtimeTransport::new(
            Arc::new(connector(Behavior::Succeed)),
            mic,
            Arc::new(StaticCredential::new(key())),
            tx,
            Duration::from_secs(10),
        );

        let first = transport.begin_connect();
        let Some(SessionEvent::Connected { attempt, result }) = rx.recv().await else {
            panic!("expected connect outcome");
        };
        assert_eq!(attempt, first);

        // A newer attempt supersedes the one that just finished
        let _second = transport.begin_connect();
        assert!(!transport.accept(attempt, result.unwrap()));
        assert!(!transport.is_connected());
        assert_eq!(released.load(Ordering::SeqCst), 1);

        transport.close();
    }
}

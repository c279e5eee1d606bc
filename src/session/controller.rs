//! Session controller and its dispatch loop

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::event::{Command, EventReceiver, EventSender, SessionEvent};
use super::state::{Effect, SessionState, Trigger, transition};
use super::{SessionHandle, SessionStatus, StatusError};
use crate::Error;
use crate::bridge::CartPublisher;
use crate::config::Config;
use crate::speculative::SpeculativeAudioQueue;
use crate::tools::{FunctionCallAssembler, OPENING_INSTRUCTIONS, ToolDispatcher, session_configuration};
use crate::transport::{
    ConnectionHandle, CredentialProvider, InboundEvent, OutboundMessage, PeerConnector,
    RealtimeTransport,
};
use crate::voice::{MicrophoneSource, RecognizerEvent, SpeechRecognizer, SpeechSynthesizer};
use crate::wake::{ListenerOutcome, TerminationPhrases, WakeWordListener, WakeWordTable};

/// Spoken locally when the live connection drops
const DEGRADED_NOTICE: &str = "Sorry, I'm having trouble hearing you. One moment.";

/// Capabilities and collaborators the controller is built from
pub struct SessionComponents {
    pub recognizer: Box<dyn SpeechRecognizer>,
    pub microphone: Arc<dyn MicrophoneSource>,
    pub connector: Arc<dyn PeerConnector>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub dispatcher: Arc<dyn ToolDispatcher>,
    pub publisher: Arc<dyn CartPublisher>,
}

/// Mutable session state owned by the controller
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub state: SessionState,
    /// Whether the user wants wake listening after the live session ends
    pub keep_listening: bool,
    /// Bumped on every teardown; late results from an older epoch are stale
    pub epoch: u64,
    pub connect_attempt: u64,
    pub degraded: bool,
    /// User transcript of the current turn
    pub transcript: String,
    pub advisory: Option<String>,
    pub last_error: Option<StatusError>,
}

impl SessionContext {
    fn reset_turn(&mut self) {
        self.transcript.clear();
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            advisory: self.advisory.clone(),
            error: self.last_error.clone(),
            degraded: self.degraded,
        }
    }
}

/// Composes the listener, transport, assembler and filler queue
pub struct SessionController {
    ctx: SessionContext,
    listener: WakeWordListener,
    transport: RealtimeTransport,
    assembler: FunctionCallAssembler,
    queue: SpeculativeAudioQueue,
    termination: TerminationPhrases,
    session_config: Value,
    fallback_delay: Duration,
    events_tx: EventSender,
    events: EventReceiver,
    status: watch::Sender<SessionStatus>,
    resume_timer: Option<JoinHandle<()>>,
}

impl SessionController {
    /// Build a controller and the handle that drives it
    #[must_use]
    pub fn new(config: &Config, components: SessionComponents) -> (Self, SessionHandle) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(SessionStatus::default());

        let listener = WakeWordListener::new(
            components.recognizer,
            WakeWordTable::from_config(&config.wake),
            events_tx.clone(),
            config.wake.restart_delay,
        );
        let transport = RealtimeTransport::new(
            components.connector,
            components.microphone,
            components.credentials,
            events_tx.clone(),
            config.realtime.connect_timeout,
        );
        let assembler = FunctionCallAssembler::new(
            components.dispatcher,
            components.publisher,
            events_tx.clone(),
            config.bridge.client_id.clone(),
        );
        let queue = SpeculativeAudioQueue::new(
            components.synthesizer,
            events_tx.clone(),
            config.speculative.clone(),
        );

        let handle = SessionHandle::new(events_tx.clone(), status_rx);
        let controller = Self {
            ctx: SessionContext::default(),
            listener,
            transport,
            assembler,
            queue,
            termination: TerminationPhrases::from_config(&config.wake),
            session_config: session_configuration(&config.realtime),
            fallback_delay: config.wake.connect_fallback_delay,
            events_tx,
            events,
            status,
            resume_timer: None,
        };
        (controller, handle)
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.ctx.state
    }

    /// Read-only view of the session context
    #[must_use]
    pub const fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Dispatch events until shutdown
    pub async fn run(mut self) {
        tracing::info!("session controller started");
        while let Some(event) = self.events.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }
        self.teardown();
        tracing::info!("session controller stopped");
    }

    /// React to one event; false when the loop should exit
    pub fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Command(command) => return self.on_command(command),
            SessionEvent::Recognizer { generation, event } => self.on_recognizer(generation, event),
            SessionEvent::ListenerRestartDue { generation } => self.on_restart_due(generation),
            SessionEvent::ListenerResumeDue { epoch } => self.on_resume_due(epoch),
            SessionEvent::Connected { attempt, result } => self.on_connected(attempt, result),
            SessionEvent::Transport { generation, event } => self.on_transport(generation, event),
            SessionEvent::ToolCompleted {
                epoch,
                call_id,
                name,
                outcome,
            } => {
                if epoch != self.ctx.epoch || self.ctx.state != SessionState::Active {
                    tracing::debug!(call_id = %call_id, epoch, current = self.ctx.epoch, "discarding stale tool result");
                } else {
                    self.assembler.on_result(
                        &call_id,
                        &name,
                        outcome,
                        &mut self.transport,
                        &mut self.queue,
                    );
                }
            }
            SessionEvent::FillerDue {
                call_id,
                text,
                priority,
            } => {
                if self.ctx.state == SessionState::Active {
                    self.queue.follow_up(&call_id, text, priority);
                }
            }
            SessionEvent::SpeculationTimeout { call_id } => self.queue.expire(&call_id),
            SessionEvent::UtteranceFinished { ticket } => self.queue.finished(ticket),
        }
        true
    }

    fn on_command(&mut self, command: Command) -> bool {
        tracing::debug!(?command, state = %self.ctx.state, "session command");
        match command {
            Command::Start => {
                self.ctx.keep_listening = true;
                if self.ctx.state == SessionState::Idle {
                    self.ctx.last_error = None;
                    self.ctx.advisory = None;
                }
                self.apply(Trigger::StartRequested);
            }
            Command::ReturnToWake => {
                self.ctx.keep_listening = true;
                self.apply(Trigger::ReturnToWake);
            }
            Command::Stop => {
                self.ctx.keep_listening = false;
                self.apply(Trigger::StopRequested);
            }
            Command::Shutdown => {
                self.ctx.keep_listening = false;
                self.apply(Trigger::StopRequested);
                return false;
            }
        }
        true
    }

    fn on_recognizer(&mut self, generation: u64, event: RecognizerEvent) {
        let may_restart = self.ctx.state == SessionState::WakeListening && self.ctx.keep_listening;
        match self.listener.handle(generation, event, may_restart) {
            ListenerOutcome::Ignored | ListenerOutcome::RestartScheduled => {}
            ListenerOutcome::Activated(_) => {
                self.apply(Trigger::WakeActivated);
            }
            ListenerOutcome::Advisory(message) => self.advise(message),
            ListenerOutcome::Fatal(error) => self.fatal(&error),
        }
    }

    fn on_restart_due(&mut self, generation: u64) {
        if self.ctx.state != SessionState::WakeListening || !self.ctx.keep_listening {
            return;
        }
        match self.listener.restart(generation) {
            Ok(true) => tracing::debug!(generation, "wake listener restarted"),
            Ok(false) => {}
            Err(e) => self.listener_failed(&e),
        }
    }

    fn on_resume_due(&mut self, epoch: u64) {
        self.resume_timer = None;
        if epoch != self.ctx.epoch
            || self.ctx.state != SessionState::WakeListening
            || self.listener.is_running()
        {
            return;
        }
        self.start_listener();
    }

    fn on_connected(&mut self, attempt: u64, result: crate::Result<ConnectionHandle>) {
        if self.ctx.state != SessionState::Connecting || !self.transport.is_current(attempt) {
            tracing::debug!(attempt, state = %self.ctx.state, "ignoring stale connect outcome");
            // A late handle is closed when dropped
            return;
        }

        match result {
            Ok(handle) => {
                if self.transport.accept(attempt, handle) {
                    self.ctx.advisory = None;
                    self.apply(Trigger::ConnectionEstablished);
                }
            }
            Err(e) if e.is_session_fatal() => self.fatal(&e),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "connect attempt failed");
                self.ctx.advisory = Some(format!("could not connect: {e}"));
                self.apply(Trigger::ConnectionFailed);
            }
        }
    }

    fn on_transport(&mut self, generation: u64, event: InboundEvent) {
        if self.ctx.state != SessionState::Active || !self.transport.is_live_generation(generation) {
            tracing::debug!(generation, kind = event.kind(), "ignoring event from inactive connection");
            return;
        }

        let fatal = event.is_fatal_error();
        match event {
            InboundEvent::ConnectionEstablished => {
                if self.ctx.degraded {
                    tracing::info!("connection recovered");
                    self.ctx.degraded = false;
                    self.publish_status();
                }
            }
            InboundEvent::ConnectionDisconnected => {
                if !self.ctx.degraded {
                    tracing::warn!("connection degraded");
                    self.ctx.degraded = true;
                    self.queue.notice(DEGRADED_NOTICE);
                    self.publish_status();
                }
            }
            InboundEvent::ConnectionFailed { reason } => {
                let reason = reason.unwrap_or_else(|| "connection lost".to_string());
                tracing::warn!(reason = %reason, "live connection failed");
                self.ctx.advisory = Some(reason);
                self.apply(Trigger::ReturnToWake);
            }
            InboundEvent::SpeechStarted => {
                tracing::debug!("user started speaking");
                self.ctx.reset_turn();
            }
            InboundEvent::SpeechStopped => tracing::debug!("user stopped speaking"),
            InboundEvent::TranscriptDelta { delta } => self.ctx.transcript.push_str(&delta),
            InboundEvent::TranscriptCompleted { transcript } => {
                let heard = if transcript.trim().is_empty() {
                    std::mem::take(&mut self.ctx.transcript)
                } else {
                    transcript
                };
                self.ctx.reset_turn();
                tracing::info!(transcript = %heard, "user turn transcribed");
                if let Some(phrase) = self.termination.find(&heard) {
                    tracing::info!(phrase, "termination phrase heard");
                    self.ctx.keep_listening = true;
                    self.apply(Trigger::ReturnToWake);
                }
            }
            InboundEvent::TranscriptFailed { error } => {
                self.ctx.reset_turn();
                self.advise(format!(
                    "could not transcribe that: {}",
                    error.as_deref().unwrap_or("unknown error")
                ));
            }
            InboundEvent::FunctionCallDelta {
                call_id,
                name,
                delta,
            } => {
                self.assembler
                    .on_fragment(&call_id, name.as_deref(), &delta, &mut self.queue);
            }
            InboundEvent::FunctionCallCompleted {
                call_id,
                name,
                arguments,
            } => {
                self.assembler.on_completed(
                    &call_id,
                    name.as_deref(),
                    arguments.as_deref(),
                    self.ctx.epoch,
                    &mut self.transport,
                    &mut self.queue,
                );
            }
            InboundEvent::AudioStarted => {
                tracing::debug!("remote audio started, preempting filler");
                self.queue.preempt();
            }
            InboundEvent::AudioStopped => tracing::debug!("remote audio stopped"),
            InboundEvent::Error { message, .. } => {
                if fatal {
                    self.fatal(&Error::FatalTransport(message));
                } else {
                    self.advise(format!("realtime error: {message}"));
                }
            }
        }
    }

    /// Run `trigger` through the state machine and perform its effects
    fn apply(&mut self, trigger: Trigger) -> bool {
        let from = self.ctx.state;
        let (next, effects) = match transition(from, trigger) {
            Ok(next) => next,
            Err(rejected) => {
                tracing::debug!(%rejected, "transition rejected");
                return false;
            }
        };

        // State flips before any effect so racing callbacks see the new state
        self.ctx.state = next;
        tracing::info!(from = %from, to = %next, ?trigger, "session transition");
        self.publish_status();

        for effect in effects {
            self.perform(effect);
        }

        if self.ctx.state == SessionState::Closing {
            self.apply(Trigger::Released {
                keep_listening: self.ctx.keep_listening,
            });
        }
        true
    }

    fn perform(&mut self, effect: Effect) {
        match effect {
            Effect::StartListener => self.start_listener(),
            Effect::StopListener => self.listener.stop(),
            Effect::ScheduleListenerResume => self.schedule_resume(),
            Effect::BeginConnect => {
                self.ctx.connect_attempt = self.transport.begin_connect();
            }
            Effect::ConfigureSession => {
                let configured = self
                    .transport
                    .send(&OutboundMessage::SessionUpdate(self.session_config.clone()));
                let opened = self.transport.send(&OutboundMessage::ResponseCreate {
                    instructions: Some(OPENING_INSTRUCTIONS.to_string()),
                });
                if !(configured && opened) {
                    tracing::warn!("session configuration not delivered");
                }
            }
            Effect::Teardown => self.teardown(),
        }
    }

    fn start_listener(&mut self) {
        self.cancel_resume();
        if let Err(e) = self.listener.start() {
            self.listener_failed(&e);
        }
    }

    fn listener_failed(&mut self, error: &Error) {
        if error.is_session_fatal() {
            self.fatal(error);
        } else {
            tracing::warn!(error = %error, "wake listener could not start");
            self.advise(format!("wake listening unavailable: {error}"));
            self.schedule_resume();
        }
    }

    /// Shared cleanup for every exit path
    fn teardown(&mut self) {
        self.queue.clear();
        self.transport.close();
        self.listener.stop();
        self.assembler.reset();
        self.cancel_resume();
        self.ctx.reset_turn();
        self.ctx.degraded = false;
        self.ctx.epoch += 1;
        tracing::debug!(epoch = self.ctx.epoch, "session torn down");
    }

    fn fatal(&mut self, error: &Error) {
        tracing::error!(error = %error, "session-fatal error");
        self.ctx.last_error = Some(StatusError::from(error));
        self.ctx.keep_listening = false;
        if !self.apply(Trigger::Fatal) {
            // Already idle or closing; make sure nothing is left running
            self.teardown();
            self.publish_status();
        }
    }

    fn advise(&mut self, message: String) {
        tracing::warn!(advisory = %message, "session advisory");
        self.ctx.advisory = Some(message);
        self.publish_status();
    }

    fn schedule_resume(&mut self) {
        self.cancel_resume();
        let epoch = self.ctx.epoch;
        let delay = self.fallback_delay;
        let events = self.events_tx.clone();
        self.resume_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::ListenerResumeDue { epoch });
        }));
    }

    fn cancel_resume(&mut self) {
        if let Some(timer) = self.resume_timer.take() {
            timer.abort();
        }
    }

    fn publish_status(&self) {
        self.status.send_replace(self.ctx.status());
    }
}

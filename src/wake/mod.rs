//! Wake word listening
//!
//! Keeps a recognizer running while the session waits for a wake phrase,
//! restarting it whenever it ends on its own. Each recognizer run gets a
//! fresh generation number; callbacks from any other run are ignored, so a
//! late result from a stopped run can never activate the session.

mod table;

use std::time::Duration;

use tokio::task::JoinHandle;

pub use table::{TerminationPhrases, WakeMatch, WakeWordTable, normalize};

use crate::session::{EventSender, SessionEvent};
use crate::voice::{RecognitionError, RecognizerEvent, RecognizerSink, SpeechRecognizer};
use crate::{Error, Result};

/// What the controller should do after a recognizer callback
#[derive(Debug)]
pub enum ListenerOutcome {
    /// Nothing to do
    Ignored,
    /// A wake phrase was heard; the listener has already stopped itself
    Activated(WakeMatch),
    /// The recognizer ended and a restart is scheduled
    RestartScheduled,
    /// Non-fatal problem worth showing the user
    Advisory(String),
    /// Listening cannot continue
    Fatal(Error),
}

/// Continuous wake phrase detection over a [`SpeechRecognizer`]
pub struct WakeWordListener {
    recognizer: Box<dyn SpeechRecognizer>,
    table: WakeWordTable,
    events: EventSender,
    restart_delay: Duration,
    generation: u64,
    running: bool,
    /// One-shot guard: cleared synchronously on the first match
    armed: bool,
    restart_timer: Option<JoinHandle<()>>,
}

impl WakeWordListener {
    /// Create a listener; it stays stopped until [`start`](Self::start)
    #[must_use]
    pub fn new(
        recognizer: Box<dyn SpeechRecognizer>,
        table: WakeWordTable,
        events: EventSender,
        restart_delay: Duration,
    ) -> Self {
        tracing::debug!(
            phrases = ?table.canonical_phrases().collect::<Vec<_>>(),
            "wake word listener initialized"
        );

        Self {
            recognizer,
            table,
            events,
            restart_delay,
            generation: 0,
            running: false,
            armed: false,
            restart_timer: None,
        }
    }

    /// Begin continuous recognition
    ///
    /// # Errors
    ///
    /// Returns error if the recognizer cannot start
    pub fn start(&mut self) -> Result<()> {
        self.cancel_restart();
        self.armed = true;
        self.launch()
    }

    /// Stop recognition and invalidate every callback from the current run
    pub fn stop(&mut self) {
        self.cancel_restart();
        let was_running = self.running;
        self.running = false;
        self.armed = false;
        self.generation += 1;
        self.recognizer.stop();
        if was_running {
            tracing::debug!("wake word listener stopped");
        }
    }

    /// Whether a recognizer run is live
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Whether the listener can still activate
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.armed
    }

    /// Current run generation
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// The wake table in use
    #[must_use]
    pub const fn table(&self) -> &WakeWordTable {
        &self.table
    }

    /// React to a recognizer callback
    ///
    /// `may_restart` tells the listener whether the controller still wants
    /// wake listening (no transition in progress).
    pub fn handle(
        &mut self,
        generation: u64,
        event: RecognizerEvent,
        may_restart: bool,
    ) -> ListenerOutcome {
        if generation != self.generation {
            tracing::trace!(generation, current = self.generation, "stale recognizer event");
            return ListenerOutcome::Ignored;
        }

        match event {
            RecognizerEvent::Result {
                transcript,
                is_final,
            } => {
                if !self.armed {
                    return ListenerOutcome::Ignored;
                }
                tracing::trace!(transcript = %transcript, is_final, "recognizer result");
                match self.table.find_match(&transcript) {
                    Some(wake) => {
                        self.armed = false;
                        self.stop();
                        tracing::info!(
                            phrase = %wake.canonical,
                            variant = %wake.variant,
                            transcript = %transcript,
                            "wake phrase detected"
                        );
                        ListenerOutcome::Activated(wake)
                    }
                    None => ListenerOutcome::Ignored,
                }
            }
            RecognizerEvent::End => {
                self.running = false;
                if may_restart && self.armed {
                    self.schedule_restart();
                    ListenerOutcome::RestartScheduled
                } else {
                    tracing::debug!("recognizer ended, not restarting");
                    ListenerOutcome::Ignored
                }
            }
            RecognizerEvent::Error(RecognitionError::PermissionDenied(msg)) => {
                tracing::error!(error = %msg, "recognizer permission denied");
                self.stop();
                ListenerOutcome::Fatal(Error::PermissionDenied(msg))
            }
            RecognizerEvent::Error(e) if e.is_transient() => {
                tracing::debug!(error = ?e, "transient recognition error");
                ListenerOutcome::Ignored
            }
            RecognizerEvent::Error(e) => {
                tracing::warn!(error = ?e, "recognition error");
                ListenerOutcome::Advisory(format!("speech recognition problem: {e:?}"))
            }
        }
    }

    /// Restart after the backoff elapsed
    ///
    /// Returns false when the restart no longer applies (stopped, activated,
    /// or superseded). Falls back to reinitializing the recognizer if a plain
    /// start fails.
    ///
    /// # Errors
    ///
    /// Returns error if the recognizer cannot be restarted at all
    pub fn restart(&mut self, generation: u64) -> Result<bool> {
        if generation != self.generation || self.running || !self.armed {
            return Ok(false);
        }
        self.cancel_restart();

        match self.launch() {
            Ok(()) => Ok(true),
            Err(e @ Error::PermissionDenied(_)) => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "recognizer restart failed, reinitializing");
                self.recognizer.reinitialize()?;
                self.launch()?;
                Ok(true)
            }
        }
    }

    fn launch(&mut self) -> Result<()> {
        self.generation += 1;
        let sink = RecognizerSink::new(self.events.clone(), self.generation);
        match self.recognizer.start(sink) {
            Ok(()) => {
                self.running = true;
                tracing::debug!(generation = self.generation, "recognizer started");
                Ok(())
            }
            Err(e) => {
                self.running = false;
                Err(e)
            }
        }
    }

    fn schedule_restart(&mut self) {
        self.cancel_restart();
        let generation = self.generation;
        let delay = self.restart_delay;
        let events = self.events.clone();
        tracing::debug!(generation, delay_ms = delay.as_millis(), "scheduling recognizer restart");
        self.restart_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::ListenerRestartDue { generation });
        }));
    }

    fn cancel_restart(&mut self) {
        if let Some(timer) = self.restart_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for WakeWordListener {
    fn drop(&mut self) {
        self.cancel_restart();
        self.recognizer.stop();
    }
}

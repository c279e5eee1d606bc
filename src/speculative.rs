//! Speculative filler speech
//!
//! While a tool call is in flight, short canned sentences are spoken locally
//! so the customer hears an immediate reaction. Items play one at a time in
//! priority order (FIFO within a tier). Everything speculative is dropped the
//! moment the remote model's own audio starts.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SpeculativeConfig;
use crate::session::{EventSender, SessionEvent};
use crate::tools::ToolKind;
use crate::voice::SpeechSynthesizer;

/// Spoken when a function has no canned sentence
pub const FALLBACK_SENTENCE: &str = "One moment.";

const CANNED_SENTENCES: &[(&str, &str)] = &[
    ("search_drinks", "Let me look that up for you."),
    ("get_drink_details", "Let me pull up the details on that one."),
    ("list_drink_categories", "Sure, here's what we've got."),
    ("check_inventory", "Let me check if we have that in stock."),
    ("view_cart", "Let me check your cart."),
    ("add_drink_to_cart", "Coming right up, adding that now."),
    ("remove_drink_from_cart", "Sure, taking that off."),
    ("update_cart_quantity", "Got it, updating that."),
    ("clear_cart", "Okay, clearing your cart."),
    ("process_order", "Great, putting your order through now."),
    ("list_event_packages", "Let me grab our event packages."),
    ("get_order_status", "Let me check on that order."),
];

/// Filler spoken while an ordering call is still running
const FOLLOW_UPS: [(&str, Priority); 2] = [
    ("Still working on that, one moment.", Priority::Medium),
    ("Almost there, thanks for your patience.", Priority::Low),
];

/// Canned sentence for a function name
#[must_use]
pub fn canned_sentence(name: &str) -> &'static str {
    CANNED_SENTENCES
        .iter()
        .find(|(n, _)| *n == name)
        .map_or(FALLBACK_SENTENCE, |(_, text)| *text)
}

/// Playback priority; higher plays first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    const fn tier(self) -> usize {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

/// Whether an item may be purged early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// Filler; purged on timeout or real audio
    Speculative,
    /// Local notice that survives request timeouts
    Final,
}

/// One queued utterance
#[derive(Debug, Clone)]
pub struct SpeculativeItem {
    pub text: String,
    pub priority: Priority,
    pub created_at: Instant,
    pub kind: ItemKind,
}

struct Playing {
    ticket: u64,
    task: JoinHandle<()>,
}

/// Single-consumer, priority-ordered queue of local utterances
pub struct SpeculativeAudioQueue {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    events: EventSender,
    config: SpeculativeConfig,
    tiers: [VecDeque<SpeculativeItem>; 3],
    playing: Option<Playing>,
    next_ticket: u64,
    /// Calls still waiting on a result, with their timers
    outstanding: HashMap<String, Vec<JoinHandle<()>>>,
}

impl SpeculativeAudioQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        events: EventSender,
        config: SpeculativeConfig,
    ) -> Self {
        Self {
            synthesizer,
            events,
            config,
            tiers: Default::default(),
            playing: None,
            next_ticket: 0,
            outstanding: HashMap::new(),
        }
    }

    /// Queue filler for a function call that just started
    ///
    /// Enqueues the canned sentence at high priority. Ordering calls also get
    /// follow-up filler that only lands if the call is still outstanding.
    pub fn request(&mut self, call_id: &str, name: &str) {
        if !self.config.enabled {
            return;
        }

        let text = canned_sentence(name);
        tracing::debug!(call_id, function = name, text, "speculative filler requested");
        self.push(text, Priority::High, ItemKind::Speculative);

        let ordering = ToolKind::classify(name) == ToolKind::Ordering;
        let mut timers = Vec::new();

        if ordering {
            for (offset, (text, priority)) in self.config.follow_up_offsets.iter().zip(FOLLOW_UPS) {
                let event = SessionEvent::FillerDue {
                    call_id: call_id.to_string(),
                    text,
                    priority,
                };
                timers.push(self.schedule(*offset, event));
            }
        }

        let timeout = if ordering {
            self.config.ordering_timeout
        } else {
            self.config.informational_timeout
        };
        timers.push(self.schedule(
            timeout,
            SessionEvent::SpeculationTimeout {
                call_id: call_id.to_string(),
            },
        ));

        if let Some(old) = self.outstanding.insert(call_id.to_string(), timers) {
            abort_all(old);
        }
        self.pump();
    }

    /// A scheduled follow-up is due
    pub fn follow_up(&mut self, call_id: &str, text: &'static str, priority: Priority) {
        if !self.outstanding.contains_key(call_id) {
            tracing::trace!(call_id, "call no longer outstanding, skipping follow-up");
            return;
        }
        self.push(text, priority, ItemKind::Speculative);
        self.pump();
    }

    /// A request's timeout elapsed without a result or real audio
    pub fn expire(&mut self, call_id: &str) {
        if let Some(timers) = self.outstanding.remove(call_id) {
            abort_all(timers);
            let purged = self.purge_speculative();
            tracing::debug!(call_id, purged, "speculative filler timed out");
        }
    }

    /// The call's result arrived; stop its timers and pending follow-ups
    pub fn resolve(&mut self, call_id: &str) {
        if let Some(timers) = self.outstanding.remove(call_id) {
            abort_all(timers);
        }
    }

    /// Real audio started: drop all filler and cut the current utterance
    pub fn preempt(&mut self) {
        for (_, timers) in self.outstanding.drain() {
            abort_all(timers);
        }
        self.clear_tiers();
        self.stop_current();
    }

    /// Queue a local notice
    pub fn notice(&mut self, text: &str) {
        self.push(text, Priority::High, ItemKind::Final);
        self.pump();
    }

    /// Drop everything; used on every session teardown
    pub fn clear(&mut self) {
        self.preempt();
    }

    /// The consumer finished (or failed) an utterance
    pub fn finished(&mut self, ticket: u64) {
        if self.playing.as_ref().is_some_and(|p| p.ticket == ticket) {
            self.playing = None;
            self.pump();
        }
    }

    /// Number of queued items, excluding the one playing
    #[must_use]
    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an utterance is playing
    #[must_use]
    pub const fn is_playing(&self) -> bool {
        self.playing.is_some()
    }

    /// Whether filler is still wanted for `call_id`
    #[must_use]
    pub fn is_outstanding(&self, call_id: &str) -> bool {
        self.outstanding.contains_key(call_id)
    }

    /// Texts in the order they would play
    #[must_use]
    pub fn pending_texts(&self) -> Vec<&str> {
        self.tiers
            .iter()
            .flat_map(|tier| tier.iter().map(|item| item.text.as_str()))
            .collect()
    }

    fn push(&mut self, text: &str, priority: Priority, kind: ItemKind) {
        self.tiers[priority.tier()].push_back(SpeculativeItem {
            text: text.to_string(),
            priority,
            created_at: Instant::now(),
            kind,
        });
    }

    fn pop(&mut self) -> Option<SpeculativeItem> {
        self.tiers.iter_mut().find_map(VecDeque::pop_front)
    }

    fn pump(&mut self) {
        if self.playing.is_some() {
            return;
        }
        let Some(item) = self.pop() else {
            return;
        };

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let synthesizer = Arc::clone(&self.synthesizer);
        let events = self.events.clone();

        tracing::debug!(
            ticket,
            priority = ?item.priority,
            waited_ms = item.created_at.elapsed().as_millis(),
            "speaking filler"
        );
        let task = tokio::spawn(async move {
            if let Err(e) = synthesizer.speak(&item.text).await {
                tracing::warn!(error = %e, "filler utterance failed");
            }
            let _ = events.send(SessionEvent::UtteranceFinished { ticket });
        });
        self.playing = Some(Playing { ticket, task });
    }

    fn purge_speculative(&mut self) -> usize {
        let before = self.len();
        for tier in &mut self.tiers {
            tier.retain(|item| item.kind == ItemKind::Final);
        }
        before - self.len()
    }

    fn clear_tiers(&mut self) {
        for tier in &mut self.tiers {
            tier.clear();
        }
    }

    fn stop_current(&mut self) {
        if let Some(playing) = self.playing.take() {
            playing.task.abort();
            self.synthesizer.cancel();
        }
    }

    fn schedule(&self, delay: Duration, event: SessionEvent) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        })
    }
}

impl Drop for SpeculativeAudioQueue {
    fn drop(&mut self) {
        self.clear();
    }
}

fn abort_all(timers: Vec<JoinHandle<()>>) {
    for timer in timers {
        timer.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::Result;

    #[derive(Default)]
    struct RecordingSynth {
        spoken: Mutex<Vec<String>>,
        cancels: Mutex<usize>,
    }

    #[async_trait]
    impl SpeechSynthesizer for RecordingSynth {
        async fn speak(&self, text: &str) -> Result<()> {
            self.spoken.lock().unwrap().push(text.to_string());
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        }

        fn cancel(&self) {
            *self.cancels.lock().unwrap() += 1;
        }
    }

    fn queue() -> (
        SpeculativeAudioQueue,
        Arc<RecordingSynth>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let synth = Arc::new(RecordingSynth::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = SpeculativeAudioQueue::new(
            Arc::clone(&synth) as Arc<dyn SpeechSynthesizer>,
            tx,
            SpeculativeConfig::default(),
        );
        (queue, synth, rx)
    }

    #[test]
    fn canned_lookup_with_fallback() {
        assert_eq!(canned_sentence("add_drink_to_cart"), "Coming right up, adding that now.");
        assert_eq!(canned_sentence("teleport"), FALLBACK_SENTENCE);
    }

    #[tokio::test]
    async fn plays_priority_order_fifo_within_tier() {
        let (mut queue, _synth, _rx) = queue();
        queue.push("low", Priority::Low, ItemKind::Speculative);
        queue.push("high", Priority::High, ItemKind::Speculative);
        queue.push("medium", Priority::Medium, ItemKind::Speculative);
        queue.push("high-2", Priority::High, ItemKind::Speculative);

        assert_eq!(queue.pending_texts(), vec!["high", "high-2", "medium", "low"]);

        let order: Vec<String> = std::iter::from_fn(|| queue.pop().map(|i| i.text)).collect();
        assert_eq!(order, vec!["high", "high-2", "medium", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_flight_consumer() {
        let (mut queue, synth, mut rx) = queue();
        queue.notice("first");
        queue.notice("second");

        assert!(queue.is_playing());
        assert_eq!(queue.len(), 1);

        let Some(SessionEvent::UtteranceFinished { ticket }) = rx.recv().await else {
            panic!("expected utterance to finish");
        };
        assert_eq!(synth.spoken.lock().unwrap().as_slice(), ["first"]);

        queue.finished(ticket);
        assert!(queue.is_playing());
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn preempt_empties_queue_and_stops_playback() {
        let (mut queue, synth, _rx) = queue();
        queue.request("c1", "add_drink_to_cart");
        queue.notice("connection is a bit slow");
        queue.push("more", Priority::Low, ItemKind::Speculative);
        assert!(queue.is_playing());

        queue.preempt();

        assert!(queue.is_empty());
        assert!(!queue.is_playing());
        assert!(!queue.is_outstanding("c1"));
        assert_eq!(*synth.cancels.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ordering_follow_ups_fire_while_outstanding() {
        let (mut queue, _synth, mut rx) = queue();
        queue.request("c1", "process_order");

        let mut due = Vec::new();
        while due.len() < 2 {
            match rx.recv().await {
                Some(SessionEvent::FillerDue { call_id, text, priority }) => {
                    due.push(priority);
                    queue.follow_up(&call_id, text, priority);
                }
                Some(SessionEvent::UtteranceFinished { ticket }) => queue.finished(ticket),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(due, vec![Priority::Medium, Priority::Low]);
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_call_gets_no_follow_ups() {
        let (mut queue, _synth, mut rx) = queue();
        queue.request("c1", "add_drink_to_cart");
        queue.resolve("c1");

        // Follow-up delivered late (already in flight) is ignored
        queue.follow_up("c1", FOLLOW_UPS[0].0, Priority::Medium);
        assert!(queue.is_empty());

        tokio::time::advance(Duration::from_secs(10)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(
                matches!(event, SessionEvent::UtteranceFinished { .. }),
                "timer fired after resolve: {event:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn informational_timeout_purges_filler_but_keeps_notices() {
        let (mut queue, _synth, mut rx) = queue();
        queue.notice("playing now");
        queue.request("c1", "search_drinks");
        queue.notice("keep me");
        assert_eq!(queue.len(), 2);

        let start = Instant::now();
        loop {
            match rx.recv().await {
                Some(SessionEvent::SpeculationTimeout { call_id }) => {
                    assert!(start.elapsed() >= Duration::from_millis(1500));
                    queue.expire(&call_id);
                    break;
                }
                Some(_) => {}
                None => panic!("queue closed"),
            }
        }
        assert_eq!(queue.pending_texts(), vec!["keep me"]);
    }

    #[tokio::test]
    async fn disabled_queue_ignores_requests() {
        let synth = Arc::new(RecordingSynth::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut queue = SpeculativeAudioQueue::new(
            synth,
            tx,
            SpeculativeConfig {
                enabled: false,
                ..SpeculativeConfig::default()
            },
        );
        queue.request("c1", "process_order");
        assert!(queue.is_empty());
        assert!(!queue.is_playing());
    }
}

//! Hierarchical event bus (C1, spec §4.1).
//!
//! Grounded in the teacher's `event_bus.rs` lock-around-shared-state idiom
//! (a `parking_lot::Mutex`-guarded observer list plus a broadcast-style fan
//! out), generalized to also own the hierarchy cursor the spec requires and
//! to fan out through bounded, drop-newest per-subscriber mailboxes instead
//! of a single broadcast channel.

use crate::event_sink::Tracer;
use crate::events::{Event, EventPayload, FallbackPhaseWire};
use parking_lot::{Mutex, RwLock};
use relay_core::llm::dispatch::{DispatchObserver, FallbackPhase};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

const SUBSCRIBER_MAILBOX_CAPACITY: usize = 256;

struct Cursor {
    parent_span_id: Option<String>,
    level: u32,
}

/// Whether a start event advances the hierarchy cursor normally, resets to
/// the conversation-turn special case, or keeps the ambient level (spec
/// §4.1's three cases).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    Normal,
    ConversationTurn,
    ToolCall,
}

pub struct EventBus {
    trace_id: String,
    component: &'static str,
    span_counter: AtomicU64,
    cursor: Mutex<Cursor>,
    conversation_start_span: Mutex<Option<String>>,
    tracers: RwLock<Vec<Arc<dyn Tracer>>>,
    subscribers: Mutex<Vec<mpsc::Sender<Event>>>,
}

impl EventBus {
    pub fn new(trace_id: impl Into<String>, component: &'static str) -> Self {
        Self {
            trace_id: trace_id.into(),
            component,
            span_counter: AtomicU64::new(1),
            cursor: Mutex::new(Cursor {
                parent_span_id: None,
                level: 0,
            }),
            conversation_start_span: Mutex::new(None),
            tracers: RwLock::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn add_tracer(&self, tracer: Arc<dyn Tracer>) {
        self.tracers.write().push(tracer);
    }

    /// Subscribe to the live stream. Overflowing the mailbox drops the
    /// newest event and leaves the subscriber attached (spec §4.1/§9).
    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_MAILBOX_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    fn next_span_id(&self) -> String {
        format!("span_{}", self.span_counter.fetch_add(1, Ordering::Relaxed))
    }

    fn now_nanos() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    }

    fn unix_timestamp() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn correlation_id(event_type: &str) -> String {
        format!("{event_type}_{}", Self::now_nanos())
    }

    /// Emits a start event, applying the cursor-advance rule for `kind`, and
    /// returns the event alongside the correlation id its matching end event
    /// must reuse.
    pub fn emit_start(
        &self,
        kind: StartKind,
        event_type: &str,
        payload: EventPayload,
    ) -> (Event, String) {
        let correlation_id = Self::correlation_id(event_type);
        let span_id = self.next_span_id();

        let mut cursor = self.cursor.lock();
        let (parent, level) = match kind {
            StartKind::Normal => (cursor.parent_span_id.clone(), cursor.level + 1),
            StartKind::ConversationTurn => {
                (self.conversation_start_span.lock().clone(), 2)
            }
            StartKind::ToolCall => (cursor.parent_span_id.clone(), cursor.level),
        };

        if !matches!(kind, StartKind::ToolCall) {
            cursor.parent_span_id = Some(span_id.clone());
            cursor.level = level;
        }
        drop(cursor);

        if matches!(payload, EventPayload::ConversationStart) {
            *self.conversation_start_span.lock() = Some(span_id.clone());
        }

        let event = Event {
            timestamp: Self::unix_timestamp(),
            trace_id: self.trace_id.clone(),
            span_id,
            parent_span_id: parent,
            hierarchy_level: level,
            component: self.component,
            correlation_id: Some(correlation_id.clone()),
            payload,
        };
        self.dispatch(event.clone());
        (event, correlation_id)
    }

    /// Emits an end event sharing `correlation_id` with its start. Does not
    /// move the cursor (spec §4.1: end events never decrement level).
    pub fn emit_end(&self, correlation_id: &str, payload: EventPayload) -> Event {
        let cursor = self.cursor.lock();
        let event = Event {
            timestamp: Self::unix_timestamp(),
            trace_id: self.trace_id.clone(),
            span_id: self.next_span_id(),
            parent_span_id: cursor.parent_span_id.clone(),
            hierarchy_level: cursor.level,
            component: self.component,
            correlation_id: Some(correlation_id.to_string()),
            payload,
        };
        drop(cursor);
        self.dispatch(event.clone());
        event
    }

    /// Emits a standalone event (no start/end pairing) at the ambient
    /// cursor position — e.g. `system_prompt`, `user_message`, `model_change`.
    pub fn emit(&self, payload: EventPayload) -> Event {
        let cursor = self.cursor.lock();
        let event = Event {
            timestamp: Self::unix_timestamp(),
            trace_id: self.trace_id.clone(),
            span_id: self.next_span_id(),
            parent_span_id: cursor.parent_span_id.clone(),
            hierarchy_level: cursor.level,
            component: self.component,
            correlation_id: None,
            payload,
        };
        drop(cursor);
        self.dispatch(event.clone());
        event
    }

    fn dispatch(&self, event: Event) {
        let tracers = self.tracers.read().clone();
        for tracer in tracers.iter() {
            tracer.trace(&event);
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Bridges `relay_core`'s dispatch-decision callbacks onto the event bus
/// (spec §4.5: "emits an event per attempt..."), so an embedder that wires
/// `Dispatcher::new(... , Arc::new(EventBusObserver::new(bus)))` gets
/// `fallback_attempt`/`model_change`/`throttling_detected`/
/// `all_fallbacks_failed` events for free.
pub struct EventBusObserver {
    bus: Arc<EventBus>,
}

impl EventBusObserver {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl DispatchObserver for EventBusObserver {
    fn fallback_attempt(
        &self,
        phase: FallbackPhase,
        index: usize,
        model: &str,
        success: bool,
        duration: Duration,
        error: Option<&str>,
    ) {
        self.bus.emit(EventPayload::FallbackAttempt {
            phase: FallbackPhaseWire::from(phase),
            index,
            model: model.to_string(),
            success,
            duration_ms: duration.as_millis() as u64,
            error: error.map(str::to_string),
        });
    }

    fn model_change(&self, old_model: &str, new_model: &str) {
        self.bus.emit(EventPayload::ModelChange {
            old_model: old_model.to_string(),
            new_model: new_model.to_string(),
        });
    }

    fn throttling_wait(&self, attempt: usize, wait: Duration) {
        self.bus.emit(EventPayload::ThrottlingDetected {
            attempt,
            wait_secs: wait.as_secs(),
        });
    }

    fn all_fallbacks_failed(&self, attempts: usize) {
        self.bus.emit(EventPayload::AllFallbacksFailed { attempts });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sink::NoopTracer;

    #[test]
    fn conversation_turn_resets_to_level_two() {
        let bus = EventBus::new("trace-1", "driver");
        let (_start, _c1) = bus.emit_start(StartKind::Normal, "conversation_start", EventPayload::ConversationStart);
        let (turn, _c2) = bus.emit_start(
            StartKind::ConversationTurn,
            "conversation_turn",
            EventPayload::ConversationTurn { turn: 1 },
        );
        assert_eq!(turn.hierarchy_level, 2);
    }

    #[test]
    fn tool_call_start_keeps_ambient_level() {
        let bus = EventBus::new("trace-1", "driver");
        bus.emit_start(StartKind::Normal, "conversation_start", EventPayload::ConversationStart);
        bus.emit_start(
            StartKind::ConversationTurn,
            "conversation_turn",
            EventPayload::ConversationTurn { turn: 1 },
        );
        let (gen_start, gen_corr) = bus.emit_start(
            StartKind::Normal,
            "llm_generation",
            EventPayload::LlmGenerationStart {
                model: "gpt-4o".into(),
                message_count: 1,
            },
        );
        let gen_end = bus.emit_end(
            &gen_corr,
            EventPayload::LlmGenerationEnd {
                model: "gpt-4o".into(),
                finish_reason: relay_core::FinishReason::ToolCalls,
                usage: Default::default(),
                tool_call_count: 1,
            },
        );
        let (tool_start, _tc) = bus.emit_start(
            StartKind::ToolCall,
            "tool_call",
            EventPayload::ToolCallStart {
                tool_call_id: "call_1".into(),
                tool_name: "list_files".into(),
                arguments: "{}".into(),
            },
        );
        assert_eq!(tool_start.hierarchy_level, gen_start.hierarchy_level);
        assert_eq!(tool_start.hierarchy_level, gen_end.hierarchy_level);
    }

    #[test]
    fn start_and_end_share_correlation_id() {
        let bus = EventBus::new("trace-1", "driver");
        let (start, correlation_id) =
            bus.emit_start(StartKind::Normal, "conversation_start", EventPayload::ConversationStart);
        let end = bus.emit_end(&correlation_id, EventPayload::ConversationEnd { final_text: "4".into() });
        assert_eq!(start.correlation_id, end.correlation_id);
    }

    #[tokio::test]
    async fn subscriber_receives_events() {
        let bus = EventBus::new("trace-1", "driver");
        let mut rx = bus.subscribe();
        bus.emit(EventPayload::UserMessage { content: "hi".into() });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.payload, EventPayload::UserMessage { .. }));
    }

    #[tokio::test]
    async fn full_subscriber_mailbox_drops_newest_without_disconnecting() {
        let bus = EventBus::new("trace-1", "driver");
        let rx = bus.subscribe();
        for _ in 0..(SUBSCRIBER_MAILBOX_CAPACITY + 10) {
            bus.emit(EventPayload::UserMessage { content: "spam".into() });
        }
        // Subscriber still attached; draining does not panic and yields at
        // most the mailbox capacity worth of events.
        drop(rx);
    }

    #[test]
    fn tracer_is_invoked_without_panicking() {
        let bus = EventBus::new("trace-1", "driver");
        bus.add_tracer(Arc::new(NoopTracer));
        bus.emit(EventPayload::ConversationCancelled);
    }

    #[tokio::test]
    async fn event_bus_observer_bridges_fallback_decisions_into_events() {
        let bus = Arc::new(EventBus::new("trace-1", "driver"));
        let mut rx = bus.subscribe();
        let observer = EventBusObserver::new(bus.clone());

        observer.fallback_attempt(FallbackPhase::SameProvider, 0, "gpt-4o-mini", true, Duration::from_millis(5), None);
        observer.model_change("gpt-4o", "gpt-4o-mini");
        observer.throttling_wait(0, Duration::from_secs(2));
        observer.all_fallbacks_failed(3);

        let attempt = rx.recv().await.unwrap();
        assert!(matches!(attempt.payload, EventPayload::FallbackAttempt { success: true, .. }));
        let change = rx.recv().await.unwrap();
        assert!(matches!(change.payload, EventPayload::ModelChange { .. }));
        let throttling = rx.recv().await.unwrap();
        assert!(matches!(throttling.payload, EventPayload::ThrottlingDetected { wait_secs: 2, .. }));
        let failed = rx.recv().await.unwrap();
        assert!(matches!(failed.payload, EventPayload::AllFallbacksFailed { attempts: 3 }));
    }
}

//! Tracer sinks for the event bus (spec §4.1a/§9: "sink errors are logged,
//! never raised").
//!
//! Grounded in the teacher's pervasive `log`/`tracing` usage across
//! `agent/execution/*` for `ConsoleTracer`, and in the teacher's `reqwest`
//! based outbound HTTP calls for `RemoteTracer`.

use crate::events::Event;
use std::sync::Arc;

/// A sink that receives every emitted event best-effort. Implementations
/// must never panic or block the emitting turn loop.
pub trait Tracer: Send + Sync {
    fn trace(&self, event: &Event);
}

/// Logs one line per event via `tracing`.
pub struct ConsoleTracer;

impl Tracer for ConsoleTracer {
    fn trace(&self, event: &Event) {
        match serde_json::to_string(&event.payload) {
            Ok(payload) => tracing::info!(
                trace_id = %event.trace_id,
                span_id = %event.span_id,
                parent_span_id = event.parent_span_id.as_deref().unwrap_or(""),
                level = event.hierarchy_level,
                component = event.component,
                %payload,
                "agent event",
            ),
            Err(err) => tracing::debug!("failed to serialize event payload: {err}"),
        }
    }
}

/// Posts each event as JSON to a remote trace collector. Best-effort: send
/// failures are logged and swallowed, never propagated to the caller.
pub struct RemoteTracer {
    client: reqwest::Client,
    collector_url: String,
}

impl RemoteTracer {
    pub fn new(collector_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            collector_url: collector_url.into(),
        }
    }
}

impl Tracer for RemoteTracer {
    fn trace(&self, event: &Event) {
        let client = self.client.clone();
        let url = self.collector_url.clone();
        let event = event.clone();
        tokio::spawn(async move {
            if let Err(err) = client.post(&url).json(&event).send().await {
                tracing::debug!("remote tracer failed to post event to {url}: {err}");
            }
        });
    }
}

/// Discards every event. Used as a default/test collaborator.
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn trace(&self, _event: &Event) {}
}

/// Fans an event out to several tracers in one call — convenience for
/// callers that want to register a fixed bundle at construction time.
pub fn fanout(tracers: Vec<Arc<dyn Tracer>>) -> Arc<dyn Tracer> {
    Arc::new(TracerFanout { tracers })
}

struct TracerFanout {
    tracers: Vec<Arc<dyn Tracer>>,
}

impl Tracer for TracerFanout {
    fn trace(&self, event: &Event) {
        for tracer in &self.tracers {
            tracer.trace(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTracer(Arc<AtomicUsize>);

    impl Tracer for CountingTracer {
        fn trace(&self, _event: &Event) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn sample_event() -> Event {
        Event {
            timestamp: 0,
            trace_id: "t".into(),
            span_id: "s".into(),
            parent_span_id: None,
            hierarchy_level: 0,
            component: "driver",
            correlation_id: None,
            payload: EventPayload::ConversationCancelled,
        }
    }

    #[test]
    fn console_tracer_does_not_panic_on_any_payload() {
        ConsoleTracer.trace(&sample_event());
    }

    #[test]
    fn fanout_invokes_every_tracer() {
        let count = Arc::new(AtomicUsize::new(0));
        let combined = fanout(vec![
            Arc::new(CountingTracer(count.clone())),
            Arc::new(CountingTracer(count.clone())),
        ]);
        combined.trace(&sample_event());
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }
}

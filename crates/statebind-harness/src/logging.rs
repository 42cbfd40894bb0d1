#![forbid(unsafe_code)]

//! Log setup and log capture for tests.
//!
//! [`init_test_logging`] installs a global `fmt` subscriber filtered by
//! `RUST_LOG` (default `statebind=warn`) that writes through the test
//! harness's captured output. [`LogCapture`] is a `tracing_subscriber`
//! layer that keeps `(target, level, message)` triples so a test can assert
//! that a container logged what it should have.

use std::sync::{Arc, Mutex, Once};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};

static INIT: Once = Once::new();

/// Install the global test subscriber once per process.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("statebind=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// One captured event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedEvent {
    pub target: String,
    pub level: Level,
    pub message: String,
}

/// Layer recording every event it sees.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with this capture as the thread's default subscriber.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> R {
        let subscriber = tracing_subscriber::registry().with(self.clone());
        tracing::subscriber::with_default(subscriber, f)
    }

    #[must_use]
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Whether an event with `message` was logged under `target`.
    #[must_use]
    pub fn saw(&self, target: &str, message: &str) -> bool {
        self.events()
            .iter()
            .any(|e| e.target == target && e.message == message)
    }

    /// How many events were logged at `level`.
    #[must_use]
    pub fn count_at(&self, level: Level) -> usize {
        self.events().iter().filter(|e| e.level == level).count()
    }
}

struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}").trim_matches('"').to_string());
        }
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor { message: None };
        event.record(&mut visitor);
        let captured = CapturedEvent {
            target: event.metadata().target().to_string(),
            level: *event.metadata().level(),
            message: visitor.message.unwrap_or_default(),
        };
        if let Ok(mut events) = self.events.lock() {
            events.push(captured);
        }
    }
}

use std::fmt::{self, Write as _};

use tracing::field::{Field, Visit};
use tracing::level_filters::LevelFilter;
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};

use crate::rpc::{Agent, LogRecord, methods};

/// Sends every event to the controller as a `service_log` notification.
pub struct ForwardLayer {
    agent: Agent,
}

impl ForwardLayer {
    pub fn new(agent: Agent) -> Self {
        Self { agent }
    }
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            level: (*metadata.level()).into(),
            target: metadata.target().to_string(),
            message: visitor.finish(),
        };
        if let Ok(params) = serde_json::to_value(&record) {
            self.agent.notify(methods::SERVICE_LOG, params);
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            self.message + &self.fields
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Make log forwarding the current thread's default subscriber.
///
/// Events below `level` are not forwarded. Forwarding stops when the guard
/// is dropped.
pub fn install(agent: Agent, level: LevelFilter) -> DefaultGuard {
    let subscriber = tracing_subscriber::registry().with(ForwardLayer::new(agent).with_filter(level));
    tracing::subscriber::set_default(subscriber)
}

use logsentry_protocol::{AttributeValue, Attributes, LogLevel, LogRecord, Timestamp};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;

/// Targets whose events never enter the pipeline.
///
/// The SDK reports its own failures through these targets; capturing them
/// would recurse a failing pipeline into itself.
const OWN_TARGETS: &[&str] = &["logsentry_sdk", "reqwest", "hyper"];

/// The log tap: a `tracing` layer copying events into the SDK buffer.
///
/// The layer is registered as an additional subscriber layer next to the
/// host's own; it never replaces or mutates existing handlers. It reads the
/// globally installed client on every event, so re-initializing the SDK
/// swaps the configuration without stacking taps.
#[derive(Debug, Default)]
pub struct LogSentryLayer {
    _private: (),
}

impl LogSentryLayer {
    /// Creates the layer for composition into the host's subscriber.
    pub fn new() -> Self {
        Self::default()
    }
}

fn convert_level(level: &Level) -> LogLevel {
    match *level {
        Level::TRACE => LogLevel::Trace,
        Level::DEBUG => LogLevel::Debug,
        Level::INFO => LogLevel::Info,
        Level::WARN => LogLevel::Warning,
        Level::ERROR => LogLevel::Error,
    }
}

/// Collects the message, service and scalar attributes of one event.
#[derive(Default)]
struct RecordVisitor {
    message: String,
    service: Option<String>,
    attributes: Attributes,
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_owned(),
            "service" => self.service = Some(value.to_owned()),
            name => self.attributes.insert(name, value),
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.attributes.insert(field.name(), value);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.attributes.insert(field.name(), value as i64);
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.attributes.insert(field.name(), value);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.attributes.insert(field.name(), value);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        // Non-scalar values flatten to their debug representation; nested
        // containers are not forwarded as structure.
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            name => self
                .attributes
                .insert(name, AttributeValue::String(format!("{value:?}"))),
        }
    }
}

impl<S: Subscriber> tracing_subscriber::Layer<S> for LogSentryLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(client) = crate::current_client() else {
            return;
        };

        let metadata = event.metadata();
        if *metadata.level() > client.max_level() {
            return;
        }

        let target = metadata.target();
        if OWN_TARGETS
            .iter()
            .any(|own| target == *own || target.starts_with(&format!("{own}::")))
        {
            return;
        }

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let mut record = LogRecord {
            timestamp: Timestamp::now(),
            level: convert_level(metadata.level()),
            message: visitor.message,
            service: visitor.service,
            attributes: visitor.attributes,
        };
        record.truncate_message();

        client.enqueue(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(convert_level(&Level::ERROR), LogLevel::Error);
        assert_eq!(convert_level(&Level::WARN), LogLevel::Warning);
        assert_eq!(convert_level(&Level::INFO), LogLevel::Info);
        assert_eq!(convert_level(&Level::DEBUG), LogLevel::Debug);
        assert_eq!(convert_level(&Level::TRACE), LogLevel::Trace);
    }
}

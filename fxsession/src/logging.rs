use anyhow::Result;
use chrono::{Local, Utc};
use std::cell::Cell;
use std::path::PathBuf;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
};

use crate::bus::EventBus;
use crate::config::RuntimeSettings;
use crate::events::{BusEvent, LogLine};
use crate::log_buffer::LogHistory;

/// Initialize tracing with a timestamped log file under `settings.log_dir` and forward
/// every event to the bus and the in-memory history.
///
/// `RUST_LOG` overrides `settings.log_level`. The returned guard flushes the file on drop.
pub fn init_logging(
    settings: &RuntimeSettings,
    bus: EventBus,
    history: LogHistory,
) -> Result<(PathBuf, WorkerGuard)> {
    let logs_dir = settings.log_dir.clone();
    std::fs::create_dir_all(&logs_dir)?;

    let timestamp = Local::now().format("%Y-%m-%d-%H-%M-%S");
    let log_filename = format!("fxsession-{}.log", timestamp);
    let log_path = logs_dir.join(&log_filename);

    let file_appender = tracing_appender::rolling::never(&logs_dir, &log_filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.as_str()));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(EventBusLayer::new(bus, history))
        .try_init()?;

    Ok((log_path, guard))
}

thread_local! {
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

/// A tracing layer that republishes events as [`LogLine`]s on the bus.
///
/// Events logged by bus subscribers while a line is being delivered are not forwarded again.
pub struct EventBusLayer {
    bus: EventBus,
    history: LogHistory,
}

impl EventBusLayer {
    pub fn new(bus: EventBus, history: LogHistory) -> Self {
        Self { bus, history }
    }
}

impl<S> Layer<S> for EventBusLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if FORWARDING.with(Cell::get) {
            return;
        }
        FORWARDING.with(|flag| flag.set(true));

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let line = LogLine {
            timestamp: Utc::now(),
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message: visitor.finish(),
        };
        self.history.push(line.clone());
        self.bus.emit(BusEvent::Log(line));

        FORWARDING.with(|flag| flag.set(false));
    }
}

/// Collects the message and any structured fields of an event.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

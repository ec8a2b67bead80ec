//! Test doubles for the session core.
//!
//! Compiled unconditionally so integration tests and downstream crates can use them.

use ctrader_api::{Request, Response};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::bus::{EventBus, Subscription};
use crate::events::{BusEvent, ErrorReport, LogLine, MetricPoint, StatusChange, Topic};
use crate::session::{
    BrokerChannel, ChannelError, ConnectionStatus, HandlerId, MessageHandler, Transport,
};

/// Transport that records what the session sends.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Request>>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following send fail.
    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Request> {
        self.sent.lock().clone()
    }

    pub fn sent_names(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(Request::name).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for RecordingTransport {
    fn send(&self, request: Request) -> Result<(), ChannelError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChannelError::Send("scripted failure".to_string()));
        }
        self.sent.lock().push(request);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Broker channel with a settable status that counts every send and handler change.
pub struct RecordingChannel {
    status: Mutex<ConnectionStatus>,
    sent: Mutex<Vec<Request>>,
    handlers: Mutex<Vec<(HandlerId, MessageHandler)>>,
    next_id: AtomicU64,
    added: AtomicUsize,
    removed: AtomicUsize,
}

impl RecordingChannel {
    pub fn new(status: ConnectionStatus) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(status),
            sent: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            added: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
        })
    }

    pub fn authenticated() -> Arc<Self> {
        Self::new(ConnectionStatus::Authenticated)
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
    }

    /// Deliver `response` to the registered handlers. Returns whether one claimed it.
    pub fn deliver(&self, response: &Response) -> bool {
        let handlers: Vec<MessageHandler> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        handlers.iter().any(|handler| handler(response))
    }

    pub fn sent(&self) -> Vec<Request> {
        self.sent.lock().clone()
    }

    pub fn sent_names(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(Request::name).collect()
    }

    pub fn send_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn added(&self) -> usize {
        self.added.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn active_handlers(&self) -> usize {
        self.handlers.lock().len()
    }
}

impl BrokerChannel for RecordingChannel {
    fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    fn send(&self, request: Request) -> Result<(), ChannelError> {
        self.sent.lock().push(request);
        Ok(())
    }

    fn add_handler(&self, handler: MessageHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.added.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().push((id, handler));
        id
    }

    fn remove_handler(&self, id: HandlerId) -> bool {
        self.removed.fetch_add(1, Ordering::SeqCst);
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        before != handlers.len()
    }
}

/// Records everything published on a bus.
pub struct ErrorProbe {
    events: Arc<Mutex<Vec<BusEvent>>>,
    subscriptions: Vec<Subscription>,
}

impl ErrorProbe {
    pub fn attach(bus: &EventBus) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let subscriptions = Topic::ALL
            .into_iter()
            .map(|topic| {
                let events = events.clone();
                bus.subscribe(topic, move |event| events.lock().push(event.clone()))
            })
            .collect();

        Self {
            events,
            subscriptions,
        }
    }

    pub fn errors(&self) -> Vec<ErrorReport> {
        self.collect(|event| match event {
            BusEvent::Error(report) => Some(report.clone()),
            _ => None,
        })
    }

    pub fn error_count(&self) -> usize {
        self.errors().len()
    }

    pub fn statuses(&self) -> Vec<StatusChange> {
        self.collect(|event| match event {
            BusEvent::Status(change) => Some(*change),
            _ => None,
        })
    }

    pub fn metrics(&self) -> Vec<MetricPoint> {
        self.collect(|event| match event {
            BusEvent::Metric(point) => Some(point.clone()),
            _ => None,
        })
    }

    pub fn logs(&self) -> Vec<LogLine> {
        self.collect(|event| match event {
            BusEvent::Log(line) => Some(line.clone()),
            _ => None,
        })
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn detach(&self) {
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
    }

    fn collect<T>(&self, pick: impl Fn(&BusEvent) -> Option<T>) -> Vec<T> {
        self.events.lock().iter().filter_map(pick).collect()
    }
}

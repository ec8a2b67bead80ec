//! Time-bounded broker requests.
//!
//! A [`RequestService`] runs at most one request at a time. It registers a response
//! handler with the session, sends, and arms a timeout. Timeouts and retries re-read the
//! session status first: once the session is no longer authenticated the request is
//! cleaned up silently, because the session already reported why.

pub mod account_funds;
pub mod trendbars;

use chrono::Utc;
use ctrader_api::{BrokerError, ErrorClass, Request, Response};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::Level;

use crate::background::BackgroundTaskManager;
use crate::bus::EventBus;
use crate::config::RetryPolicy;
use crate::events::{BusEvent, ErrorKind, ErrorReport, LogLine, MetricPoint};
use crate::log_buffer::LogHistory;
use crate::session::{BrokerChannel, ChannelError, ConnectionStatus, HandlerId, MessageHandler};

pub use account_funds::{AccountFunds, AccountFundsRequest, AccountFundsService};
pub use trendbars::{TrendbarHistory, TrendbarHistoryRequest, TrendbarHistoryService};

const TIMEOUT_TASK: &str = "timeout";
const RETRY_TASK: &str = "retry";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("a request is already in flight")]
    Busy,
    #[error("session is {0}")]
    NotAuthenticated(ConnectionStatus),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// What a service does with one inbound message.
#[derive(Debug)]
pub enum Step<T> {
    /// Not for this request
    Ignored,
    /// Consumed, still waiting for more
    Claimed,
    /// Consumed; send these and restart the timeout
    FollowUp(Vec<Request>),
    Complete(T),
    Failed(BrokerError),
}

/// The request-specific half of a [`RequestService`].
pub trait TimeBoundedRequest: Send + Sync + 'static {
    type Params: Clone + Send + Sync + 'static;
    type Progress: Default + Send + 'static;
    type Output: Send + 'static;

    /// Used in logs, error reports and metric names.
    const NAME: &'static str;

    /// Messages that open a fetch.
    fn requests(&self, params: &Self::Params, progress: &mut Self::Progress) -> Vec<Request>;

    /// Messages resent after a timeout. Starts over by default.
    fn retry_requests(&self, params: &Self::Params, progress: &mut Self::Progress) -> Vec<Request> {
        *progress = Self::Progress::default();
        self.requests(params, progress)
    }

    fn on_message(
        &self,
        params: &Self::Params,
        progress: &mut Self::Progress,
        response: &Response,
    ) -> Step<Self::Output>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestOptions {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
        }
    }
}

pub type ResultCallback<T> = Arc<dyn Fn(T) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&ErrorReport) + Send + Sync>;
pub type LogCallback = Arc<dyn Fn(&LogLine) + Send + Sync>;

/// Callbacks a presentation layer can attach to a service.
pub struct ServiceCallbacks<T> {
    pub on_result: Option<ResultCallback<T>>,
    pub on_error: Option<ErrorCallback>,
    pub on_log: Option<LogCallback>,
}

impl<T> Default for ServiceCallbacks<T> {
    fn default() -> Self {
        Self {
            on_result: None,
            on_error: None,
            on_log: None,
        }
    }
}

impl<T> Clone for ServiceCallbacks<T> {
    fn clone(&self) -> Self {
        Self {
            on_result: self.on_result.clone(),
            on_error: self.on_error.clone(),
            on_log: self.on_log.clone(),
        }
    }
}

/// Implemented by collaborators that accept callback wiring.
pub trait SetCallbacks {
    type Output;

    fn set_callbacks(&self, callbacks: ServiceCallbacks<Self::Output>);
}

struct InFlight<S: TimeBoundedRequest> {
    generation: u64,
    params: S::Params,
    progress: S::Progress,
    handler: Option<HandlerId>,
    attempt: u32,
    started: Instant,
}

enum TimeoutAction<S: TimeBoundedRequest> {
    Cleanup(InFlight<S>),
    Retry(u32),
    Exhausted(InFlight<S>),
}

pub struct RequestService<S: TimeBoundedRequest> {
    inner: Arc<ServiceInner<S>>,
}

impl<S: TimeBoundedRequest> Clone for RequestService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ServiceInner<S: TimeBoundedRequest> {
    request: S,
    channel: Arc<dyn BrokerChannel>,
    bus: EventBus,
    options: RequestOptions,
    // Every transition of the in-flight request happens under this lock
    state: Mutex<Option<InFlight<S>>>,
    generation: AtomicU64,
    tasks: BackgroundTaskManager,
    callbacks: RwLock<ServiceCallbacks<S::Output>>,
    history: LogHistory,
}

impl<S: TimeBoundedRequest> RequestService<S> {
    pub fn new(
        request: S,
        channel: Arc<dyn BrokerChannel>,
        bus: EventBus,
        options: RequestOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                request,
                channel,
                bus,
                options,
                state: Mutex::new(None),
                generation: AtomicU64::new(0),
                tasks: BackgroundTaskManager::new(),
                callbacks: RwLock::new(ServiceCallbacks::default()),
                history: LogHistory::new(200),
            }),
        }
    }

    pub fn request(&self) -> &S {
        &self.inner.request
    }

    pub fn is_busy(&self) -> bool {
        self.inner.state.lock().is_some()
    }

    /// Retries already used by the in-flight request.
    pub fn attempt(&self) -> Option<u32> {
        self.inner.state.lock().as_ref().map(|flight| flight.attempt)
    }

    /// Start a request. The result arrives through the callbacks and the bus.
    pub fn fetch(&self, params: S::Params) -> Result<(), FetchError> {
        let status = self.inner.channel.status();
        if status != ConnectionStatus::Authenticated {
            self.log(Level::DEBUG, format!("{} request skipped while {}", S::NAME, status));
            return Err(FetchError::NotAuthenticated(status));
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let requests = {
            let mut state = self.inner.state.lock();
            if state.is_some() {
                return Err(FetchError::Busy);
            }
            let mut progress = S::Progress::default();
            let requests = self.inner.request.requests(&params, &mut progress);
            *state = Some(InFlight {
                generation,
                params,
                progress,
                handler: None,
                attempt: 0,
                started: Instant::now(),
            });
            requests
        };

        let handler_id = self.inner.channel.add_handler(self.handler(generation));
        let registered = match self.inner.state.lock().as_mut() {
            Some(flight) if flight.generation == generation => {
                flight.handler = Some(handler_id);
                true
            }
            _ => false,
        };
        if !registered {
            // Finished before the id was recorded
            self.inner.channel.remove_handler(handler_id);
            return Ok(());
        }

        if let Err(e) = self.send_all(requests) {
            if let Some(flight) = self.take(generation) {
                self.finish(&flight);
            }
            self.log(Level::WARN, format!("{} request could not be sent: {}", S::NAME, e));
            return Err(e.into());
        }

        self.log(Level::DEBUG, format!("{} request sent", S::NAME));
        self.arm_timeout(generation);
        Ok(())
    }

    /// Drop the in-flight request without reporting anything.
    pub fn cancel(&self) -> bool {
        let flight = self.inner.state.lock().take();
        match flight {
            Some(flight) => {
                self.finish(&flight);
                true
            }
            None => false,
        }
    }

    /// Fire the timeout of the in-flight request now.
    pub fn on_timeout(&self) {
        if let Some(generation) = self.current_generation() {
            self.timeout_fired(generation);
        }
    }

    /// Run retry number `attempt` of the in-flight request now.
    pub fn retry(&self, attempt: u32) {
        if let Some(generation) = self.current_generation() {
            self.retry_fired(generation, attempt);
        }
    }

    fn handler(&self, generation: u64) -> MessageHandler {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |response: &Response| match Self::upgrade(&weak) {
            Some(service) => service.on_message(generation, response),
            None => false,
        })
    }

    fn on_message(&self, generation: u64, response: &Response) -> bool {
        if let Response::Error(error) = response {
            // Token errors belong to the session
            if error.classify() == ErrorClass::InvalidToken {
                return false;
            }
        }

        let (step, finished) = {
            let mut state = self.inner.state.lock();
            let flight = match state.as_mut() {
                Some(flight) if flight.generation == generation => flight,
                _ => return false,
            };
            let step = self
                .inner
                .request
                .on_message(&flight.params, &mut flight.progress, response);
            let finished = match step {
                Step::Complete(_) | Step::Failed(_) => state.take(),
                _ => None,
            };
            (step, finished)
        };

        match step {
            Step::Ignored => false,
            Step::Claimed => true,
            Step::FollowUp(requests) => {
                if let Err(e) = self.send_all(requests) {
                    self.abandon(generation, format!("{} request could not be sent: {}", S::NAME, e));
                } else {
                    self.arm_timeout(generation);
                }
                true
            }
            Step::Complete(output) => {
                if let Some(flight) = finished {
                    self.finish(&flight);
                    let latency = flight.started.elapsed().as_secs_f64() * 1000.0;
                    self.metric(MetricPoint::gauge(
                        format!("{}.latency_ms", metric_prefix(S::NAME)),
                        latency,
                    ));
                    self.log(Level::INFO, format!("{} request completed", S::NAME));
                    let callback = self.inner.callbacks.read().on_result.clone();
                    if let Some(callback) = callback {
                        callback(output);
                    }
                }
                true
            }
            Step::Failed(error) => {
                if let Some(flight) = finished {
                    self.finish(&flight);
                    self.log(Level::WARN, format!("{} request failed: {}", S::NAME, error));
                    self.report(ErrorReport::broker(S::NAME, &error));
                }
                true
            }
        }
    }

    fn timeout_fired(&self, generation: u64) {
        let status = self.inner.channel.status();
        let max_attempts = self.inner.options.retry.max_attempts;

        let action = {
            let mut state = self.inner.state.lock();
            let flight = match state.as_mut() {
                Some(flight) if flight.generation == generation => flight,
                _ => return,
            };
            if status != ConnectionStatus::Authenticated {
                state.take().map(TimeoutAction::Cleanup)
            } else if flight.attempt < max_attempts {
                flight.attempt += 1;
                Some(TimeoutAction::Retry(flight.attempt))
            } else {
                state.take().map(TimeoutAction::Exhausted)
            }
        };

        match action {
            Some(TimeoutAction::Cleanup(flight)) => {
                self.finish(&flight);
                self.log(
                    Level::DEBUG,
                    format!("{} request timed out while {}, cleaned up", S::NAME, status),
                );
            }
            Some(TimeoutAction::Retry(attempt)) => {
                let message = format!(
                    "{} request timed out (attempt {}/{})",
                    S::NAME,
                    attempt,
                    max_attempts + 1
                );
                self.log(Level::WARN, message.clone());
                self.report(ErrorReport::new(ErrorKind::Timeout, S::NAME, message));
                self.schedule_retry(generation, attempt);
            }
            Some(TimeoutAction::Exhausted(flight)) => {
                self.finish(&flight);
                let message = format!(
                    "{} request failed after {} attempts",
                    S::NAME,
                    flight.attempt + 1
                );
                self.log(Level::WARN, message.clone());
                self.report(ErrorReport::new(ErrorKind::RequestFailed, S::NAME, message));
            }
            None => {}
        }
    }

    fn schedule_retry(&self, generation: u64, attempt: u32) {
        let backoff = self.inner.options.retry.backoff;
        if backoff.is_zero() {
            self.retry_fired(generation, attempt);
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner.tasks.schedule(RETRY_TASK, backoff, move || {
            if let Some(service) = Self::upgrade(&weak) {
                service.retry_fired(generation, attempt);
            }
        });
    }

    fn retry_fired(&self, generation: u64, attempt: u32) {
        let status = self.inner.channel.status();

        let requests = {
            let mut state = self.inner.state.lock();
            if !matches!(state.as_ref(), Some(flight) if flight.generation == generation) {
                return;
            }
            if status != ConnectionStatus::Authenticated {
                let flight = state.take();
                drop(state);
                if let Some(flight) = flight {
                    self.finish(&flight);
                    self.log(
                        Level::DEBUG,
                        format!("{} retry skipped while {}, cleaned up", S::NAME, status),
                    );
                }
                return;
            }
            let Some(flight) = state.as_mut() else {
                return;
            };
            flight.attempt = flight.attempt.max(attempt);
            self.inner
                .request
                .retry_requests(&flight.params, &mut flight.progress)
        };

        self.log(Level::INFO, format!("Retrying {} request (attempt {})", S::NAME, attempt));
        match self.send_all(requests) {
            Ok(()) => self.arm_timeout(generation),
            Err(e) => self.abandon(generation, format!("{} retry could not be sent: {}", S::NAME, e)),
        }
    }

    fn arm_timeout(&self, generation: u64) {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .tasks
            .schedule(TIMEOUT_TASK, self.inner.options.timeout, move || {
                if let Some(service) = Self::upgrade(&weak) {
                    service.timeout_fired(generation);
                }
            });
    }

    fn send_all(&self, requests: Vec<Request>) -> Result<(), ChannelError> {
        for request in requests {
            self.inner.channel.send(request)?;
        }
        Ok(())
    }

    /// Give up on `generation` with one terminal failure.
    fn abandon(&self, generation: u64, message: String) {
        if let Some(flight) = self.take(generation) {
            self.finish(&flight);
            self.log(Level::WARN, message.clone());
            self.report(ErrorReport::new(ErrorKind::RequestFailed, S::NAME, message));
        }
    }

    fn take(&self, generation: u64) -> Option<InFlight<S>> {
        let mut state = self.inner.state.lock();
        match state.as_ref() {
            Some(flight) if flight.generation == generation => state.take(),
            _ => None,
        }
    }

    /// Cancel timers and drop the response handler. Called once per taken request.
    fn finish(&self, flight: &InFlight<S>) {
        self.inner.tasks.cancel(TIMEOUT_TASK);
        self.inner.tasks.cancel(RETRY_TASK);
        if let Some(id) = flight.handler {
            self.inner.channel.remove_handler(id);
        }
    }

    fn current_generation(&self) -> Option<u64> {
        self.inner
            .state
            .lock()
            .as_ref()
            .map(|flight| flight.generation)
    }

    fn report(&self, report: ErrorReport) {
        let callback = self.inner.callbacks.read().on_error.clone();
        if let Some(callback) = callback {
            callback(&report);
        }
        self.inner.bus.emit(BusEvent::Error(report));
    }

    fn metric(&self, point: MetricPoint) {
        self.inner.bus.emit(BusEvent::Metric(point));
    }

    fn log(&self, level: Level, message: String) {
        match level {
            Level::ERROR | Level::WARN => tracing::warn!(service = S::NAME, "{}", message),
            Level::INFO => tracing::info!(service = S::NAME, "{}", message),
            _ => tracing::debug!(service = S::NAME, "{}", message),
        }

        let line = LogLine {
            timestamp: Utc::now(),
            level,
            target: S::NAME.to_string(),
            message,
        };
        self.inner.history.push(line.clone());
        let callback = self.inner.callbacks.read().on_log.clone();
        if let Some(callback) = callback {
            callback(&line);
        }
    }

    fn upgrade(weak: &Weak<ServiceInner<S>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }
}

impl<S: TimeBoundedRequest> SetCallbacks for RequestService<S> {
    type Output = S::Output;

    /// A newly attached log callback first receives the lines logged so far.
    fn set_callbacks(&self, callbacks: ServiceCallbacks<S::Output>) {
        if let Some(on_log) = &callbacks.on_log {
            self.inner.history.replay(|line| on_log(line));
        }
        *self.inner.callbacks.write() = callbacks;
    }
}

fn metric_prefix(name: &str) -> String {
    name.replace(' ', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ErrorProbe, RecordingChannel};
    use ctrader_api::messages::accounts::TraderReq;
    use pretty_assertions::assert_eq;

    /// One request, answered by any heartbeat.
    struct Ping;

    impl TimeBoundedRequest for Ping {
        type Params = i64;
        type Progress = ();
        type Output = i64;

        const NAME: &'static str = "ping";

        fn requests(&self, params: &i64, _: &mut ()) -> Vec<Request> {
            vec![Request::Trader(TraderReq::new(*params))]
        }

        fn on_message(&self, params: &i64, _: &mut (), response: &Response) -> Step<i64> {
            match response {
                Response::Heartbeat => Step::Complete(*params),
                Response::Error(error) => Step::Failed(error.clone()),
                _ => Step::Ignored,
            }
        }
    }

    fn service(
        channel: &Arc<RecordingChannel>,
        bus: &EventBus,
        max_attempts: u32,
    ) -> RequestService<Ping> {
        RequestService::new(
            Ping,
            channel.clone(),
            bus.clone(),
            RequestOptions {
                timeout: Duration::from_secs(5),
                retry: RetryPolicy {
                    max_attempts,
                    backoff: Duration::from_secs(1),
                },
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_completes_request() {
        let channel = RecordingChannel::authenticated();
        let bus = EventBus::new();
        let probe = ErrorProbe::attach(&bus);
        let service = service(&channel, &bus, 2);
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        service.set_callbacks(ServiceCallbacks {
            on_result: Some(Arc::new(move |value| sink.lock().push(value))),
            ..Default::default()
        });

        service.fetch(7).unwrap();
        assert_eq!(service.fetch(8), Err(FetchError::Busy));
        assert!(channel.deliver(&Response::Heartbeat));

        assert_eq!(*results.lock(), vec![7]);
        assert!(!service.is_busy());
        assert_eq!((channel.added(), channel.removed()), (1, 1));
        assert_eq!(channel.active_handlers(), 0);
        assert!(probe
            .metrics()
            .iter()
            .any(|point| point.name == "ping.latency_ms"));

        // The timeout was cancelled with the request
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(probe.error_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_requires_authenticated_session() {
        let channel = RecordingChannel::new(ConnectionStatus::Connecting);
        let service = service(&channel, &EventBus::new(), 2);

        assert_eq!(
            service.fetch(1),
            Err(FetchError::NotAuthenticated(ConnectionStatus::Connecting))
        );
        assert_eq!(channel.send_count(), 0);
        assert_eq!(channel.added(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_retry_then_fail_once() {
        let channel = RecordingChannel::authenticated();
        let bus = EventBus::new();
        let probe = ErrorProbe::attach(&bus);
        let service = service(&channel, &bus, 2);

        service.fetch(1).unwrap();
        // timeout (5s) + backoff (1s), twice, then a final timeout
        tokio::time::sleep(Duration::from_secs(6 + 6 + 6)).await;

        assert_eq!(channel.send_count(), 3);
        let kinds: Vec<ErrorKind> = probe.errors().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![ErrorKind::Timeout, ErrorKind::Timeout, ErrorKind::RequestFailed]
        );
        assert!(!service.is_busy());
        assert_eq!((channel.added(), channel.removed()), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_backoff_resends_immediately() {
        let channel = RecordingChannel::authenticated();
        let bus = EventBus::new();
        let service = RequestService::new(
            Ping,
            channel.clone(),
            bus,
            RequestOptions {
                timeout: Duration::from_secs(5),
                retry: RetryPolicy {
                    max_attempts: 1,
                    backoff: Duration::ZERO,
                },
            },
        );

        service.fetch(1).unwrap();
        tokio::time::sleep(Duration::from_millis(5_001)).await;
        assert_eq!(channel.send_count(), 2);
        assert_eq!(service.attempt(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_failure_is_reported_once() {
        let channel = RecordingChannel::authenticated();
        let bus = EventBus::new();
        let probe = ErrorProbe::attach(&bus);
        let service = service(&channel, &bus, 2);

        service.fetch(1).unwrap();
        assert!(channel.deliver(&Response::Error(BrokerError::new("SERVER_ERROR", "boom"))));
        assert!(!channel.deliver(&Response::Error(BrokerError::new("SERVER_ERROR", "boom"))));

        let errors = probe.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Broker);
        assert_eq!(errors[0].source, "ping");
        assert_eq!(channel.removed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_errors_are_left_to_the_session() {
        let channel = RecordingChannel::authenticated();
        let service = service(&channel, &EventBus::new(), 2);

        service.fetch(1).unwrap();
        assert!(!channel.deliver(&Response::Error(BrokerError::new("104", "invalid"))));
        assert!(service.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_history_is_replayed_to_late_callback() {
        let channel = RecordingChannel::authenticated();
        let service = service(&channel, &EventBus::new(), 2);
        service.fetch(1).unwrap();

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        service.set_callbacks(ServiceCallbacks {
            on_log: Some(Arc::new(move |line: &LogLine| sink.lock().push(line.message.clone()))),
            ..Default::default()
        });
        channel.deliver(&Response::Heartbeat);

        assert_eq!(
            *lines.lock(),
            vec!["ping request sent", "ping request completed"]
        );
    }
}

use ctrader_api::messages::auth::{AccountAuthReq, ApplicationAuthReq};
use ctrader_api::{AccountId, BrokerError, ErrorClass, Request, Response};
use ctrader_auth::TokenLifecycleManager;
use parking_lot::Mutex;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::watch;

use crate::background::BackgroundTaskManager;
use crate::bus::EventBus;
use crate::events::{BusEvent, ErrorKind, ErrorReport, MetricPoint, StatusChange};

const SOURCE: &str = "session";

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Authenticated,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Authenticated => "AUTHENTICATED",
            Self::Error => "ERROR",
        }
    }

    /// Allowed moves. `Authenticated -> Connecting` is the re-authentication path.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Authenticated)
                | (Connecting, Error)
                | (Connecting, Disconnected)
                | (Authenticated, Connecting)
                | (Authenticated, Error)
                | (Authenticated, Disconnected)
                | (Error, Connecting)
        )
    }
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("transport is closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("application credentials are unavailable")]
    CredentialsUnavailable,
    #[error("session is already {0}")]
    AlreadyActive(ConnectionStatus),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Outbound half of the wire connection. Encoding and framing live behind it.
pub trait Transport: Send + Sync {
    fn send(&self, request: Request) -> Result<(), ChannelError>;

    fn close(&self) {}
}

/// Returns `true` when it claims the message, which stops further dispatch.
pub type MessageHandler = Arc<dyn Fn(&Response) -> bool + Send + Sync>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

/// What request services see of the session.
pub trait BrokerChannel: Send + Sync {
    fn status(&self) -> ConnectionStatus;

    fn send(&self, request: Request) -> Result<(), ChannelError>;

    fn add_handler(&self, handler: MessageHandler) -> HandlerId;

    /// Returns whether the handler was still registered.
    fn remove_handler(&self, id: HandlerId) -> bool;
}

/// Connection and authentication state of one broker account.
///
/// The session is the only writer of [`ConnectionStatus`]. Every transition goes through
/// one ordered update and is published on the bus when it changes the value.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    account_id: AccountId,
    status: watch::Sender<ConnectionStatus>,
    transport: Arc<dyn Transport>,
    tokens: TokenLifecycleManager,
    bus: EventBus,
    handlers: Mutex<Vec<(HandlerId, MessageHandler)>>,
    next_handler: AtomicU64,
    // One refresh-and-reauthenticate cycle per handshake
    refresh_attempted: AtomicBool,
    leeway_secs: AtomicI64,
    tasks: BackgroundTaskManager,
}

impl Session {
    pub fn new(
        account_id: AccountId,
        transport: Arc<dyn Transport>,
        tokens: TokenLifecycleManager,
        bus: EventBus,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);

        Self {
            inner: Arc::new(SessionInner {
                account_id,
                status,
                transport,
                tokens,
                bus,
                handlers: Mutex::new(Vec::new()),
                next_handler: AtomicU64::new(1),
                refresh_attempted: AtomicBool::new(false),
                leeway_secs: AtomicI64::new(60),
                tasks: BackgroundTaskManager::new(),
            }),
        }
    }

    /// Refresh the access token before the account handshake when it expires within `seconds`.
    pub fn set_leeway(&self, seconds: i64) {
        self.inner
            .leeway_secs
            .store(seconds.max(0), Ordering::Relaxed);
    }

    pub fn account_id(&self) -> AccountId {
        self.inner.account_id
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    /// Watch status changes without going through the bus.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn tokens(&self) -> &TokenLifecycleManager {
        &self.inner.tokens
    }

    /// Start the handshake by authorizing the application.
    pub fn connect(&self) -> Result<(), SessionError> {
        let current = self.status();
        if !matches!(
            current,
            ConnectionStatus::Disconnected | ConnectionStatus::Error
        ) {
            return Err(SessionError::AlreadyActive(current));
        }

        self.inner.refresh_attempted.store(false, Ordering::SeqCst);
        self.transition(ConnectionStatus::Connecting);
        tracing::info!(account_id = self.inner.account_id, "connecting to broker");

        let Some(credentials) = self.inner.tokens.credentials() else {
            self.fail(ErrorReport::new(
                ErrorKind::Credentials,
                SOURCE,
                "application credentials are unavailable",
            ));
            return Err(SessionError::CredentialsUnavailable);
        };

        let request = ApplicationAuthReq::new(
            credentials.client_id.clone(),
            credentials.client_secret.clone(),
        );
        if let Err(e) = self.inner.transport.send(Request::ApplicationAuth(request)) {
            self.fail(ErrorReport::new(ErrorKind::Network, SOURCE, e.to_string()));
            return Err(e.into());
        }
        tracing::info!("application auth sent");
        Ok(())
    }

    /// Manual teardown. Flips to `Disconnected` before returning; in-flight requests notice
    /// on their next timeout or retry check.
    pub fn disconnect(&self) {
        self.inner.tasks.cancel_all();
        self.inner.transport.close();
        if self.transition(ConnectionStatus::Disconnected) {
            tracing::info!(account_id = self.inner.account_id, "session disconnected");
        }
    }

    /// The transport dropped underneath the session.
    pub fn on_transport_lost(&self, reason: &str) {
        self.inner.tasks.cancel_all();
        if self.transition(ConnectionStatus::Disconnected) {
            tracing::warn!(account_id = self.inner.account_id, "transport lost: {}", reason);
            self.publish_error(ErrorReport::new(
                ErrorKind::Network,
                SOURCE,
                format!("transport lost: {}", reason),
            ));
        }
    }

    /// Entry point for every message the transport receives.
    pub fn handle_message(&self, response: &Response) {
        match response {
            Response::ApplicationAuth => self.on_application_authorized(),
            Response::AccountAuth(res) if res.account_id == self.inner.account_id => {
                self.on_account_authorized()
            }
            Response::Error(error) => match error.classify() {
                ErrorClass::Benign => {
                    tracing::debug!(code = %error.error_code, "Ignoring benign broker error: {}", error.description);
                }
                ErrorClass::InvalidToken => self.on_broker_error(error),
                ErrorClass::Generic => {
                    if !self.dispatch(response) {
                        self.on_broker_error(error);
                    }
                }
            },
            Response::AccountDisconnect { account_id } if *account_id == self.inner.account_id => {
                self.fail_reauthentication("account disconnected by server");
            }
            Response::AccountsTokenInvalidated {
                account_ids,
                reason,
            } if account_ids.contains(&self.inner.account_id) => {
                self.fail_reauthentication(format!("access token invalidated: {}", reason));
            }
            Response::Heartbeat => {}
            other => {
                if !self.dispatch(other) {
                    tracing::trace!(message = other.name(), "Unclaimed broker message");
                }
            }
        }
    }

    /// React to a broker error nobody else claimed.
    ///
    /// Invalid-token errors start one refresh-and-reauthenticate cycle; everything else is
    /// forwarded once, non-fatally, unless it broke the handshake.
    pub fn on_broker_error(&self, error: &BrokerError) {
        if ctrader_api::is_invalid_token_error(&error.error_code) {
            self.reauthenticate(error);
            return;
        }

        let report = ErrorReport::broker(SOURCE, error);
        if self.status() == ConnectionStatus::Connecting {
            tracing::error!(code = %error.error_code, "Handshake failed: {}", error);
            self.inner.tasks.cancel("handshake");
            self.fail(report.fatal());
        } else {
            tracing::warn!(code = %error.error_code, "Broker error: {}", error);
            self.publish_error(report);
        }
    }

    fn reauthenticate(&self, error: &BrokerError) {
        let status = self.status();
        if matches!(
            status,
            ConnectionStatus::Disconnected | ConnectionStatus::Error
        ) {
            tracing::debug!(%status, "Ignoring token error outside an active session");
            return;
        }
        if self.inner.refresh_attempted.swap(true, Ordering::SeqCst) {
            self.fail_reauthentication(error);
            return;
        }

        tracing::warn!(account_id = self.inner.account_id, "Access token rejected, refreshing: {}", error);
        self.transition(ConnectionStatus::Connecting);

        let weak = Arc::downgrade(&self.inner);
        self.inner.tasks.spawn("handshake", async move {
            let Some(session) = Session::upgrade(&weak) else {
                return;
            };
            match session.inner.tokens.refresh_current().await {
                Ok(tokens) => {
                    session.metric(MetricPoint::counter("session.refresh.success"));
                    session.send_account_auth(&tokens.access_token);
                }
                Err(e) => {
                    session.metric(MetricPoint::counter("session.refresh.failure"));
                    session.fail_reauthentication(e);
                }
            }
        });
    }

    fn on_application_authorized(&self) {
        if self.status() != ConnectionStatus::Connecting {
            tracing::debug!("Ignoring application auth outside the handshake");
            return;
        }
        tracing::info!("application authorized");

        let weak = Arc::downgrade(&self.inner);
        self.inner.tasks.spawn("handshake", async move {
            let Some(session) = Session::upgrade(&weak) else {
                return;
            };
            let leeway = session.inner.leeway_secs.load(Ordering::Relaxed);
            match session.inner.tokens.ensure_fresh(leeway).await {
                Ok(tokens) => session.send_account_auth(&tokens.access_token),
                Err(e) => session.fail_reauthentication(e),
            }
        });
    }

    fn send_account_auth(&self, access_token: &str) {
        if self.status() != ConnectionStatus::Connecting {
            tracing::debug!("Session left the handshake, account auth not sent");
            return;
        }
        let request = AccountAuthReq::new(self.inner.account_id, access_token);
        if let Err(e) = self.inner.transport.send(Request::AccountAuth(request)) {
            self.fail(ErrorReport::new(ErrorKind::Network, SOURCE, e.to_string()));
        }
    }

    fn on_account_authorized(&self) {
        if self.transition(ConnectionStatus::Authenticated) {
            self.inner.refresh_attempted.store(false, Ordering::SeqCst);
            tracing::info!(account_id = self.inner.account_id, "account authorized");
            self.metric(MetricPoint::counter("session.authenticated"));
        }
    }

    /// Move to `Error` with a single fatal "reauthentication required" report.
    fn fail_reauthentication(&self, reason: impl Display) {
        let report = ErrorReport::new(
            ErrorKind::Reauthentication,
            SOURCE,
            format!("reauthentication required: {}", reason),
        );
        tracing::error!(account_id = self.inner.account_id, "{}", report.message);
        self.fail(report);
    }

    /// Reported only when this call is what moved the session into `Error`.
    fn fail(&self, report: ErrorReport) {
        if self.transition(ConnectionStatus::Error) {
            self.publish_error(report.fatal());
        }
    }

    /// Returns whether the status changed.
    fn transition(&self, next: ConnectionStatus) -> bool {
        let mut previous = None;
        self.inner.status.send_if_modified(|current| {
            if *current == next || !current.can_transition_to(next) {
                return false;
            }
            previous = Some(*current);
            *current = next;
            true
        });

        match previous {
            Some(from) => {
                tracing::debug!(%from, to = %next, "Session status changed");
                self.inner
                    .bus
                    .emit(BusEvent::Status(StatusChange { from, to: next }));
                true
            }
            None => false,
        }
    }

    fn dispatch(&self, response: &Response) -> bool {
        let handlers: Vec<MessageHandler> = self
            .inner
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        handlers.iter().any(|handler| handler(response))
    }

    fn publish_error(&self, report: ErrorReport) {
        self.inner.bus.emit(BusEvent::Error(report));
    }

    fn metric(&self, point: MetricPoint) {
        self.inner.bus.emit(BusEvent::Metric(point));
    }

    fn upgrade(weak: &Weak<SessionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }
}

impl BrokerChannel for Session {
    fn status(&self) -> ConnectionStatus {
        Session::status(self)
    }

    fn send(&self, request: Request) -> Result<(), ChannelError> {
        tracing::trace!(message = request.name(), "Sending");
        self.inner.transport.send(request)
    }

    fn add_handler(&self, handler: MessageHandler) -> HandlerId {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        self.inner.handlers.lock().push((id, handler));
        id
    }

    fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        before != handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ErrorProbe, RecordingTransport};
    use chrono::Utc;
    use ctrader_api::messages::auth::AccountAuthRes;
    use ctrader_auth::testing::ScriptedExchange;
    use ctrader_auth::{Credentials, OAuthTokens};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use ConnectionStatus::*;

    const ACCOUNT: AccountId = 42;

    struct Fixture {
        session: Session,
        transport: Arc<RecordingTransport>,
        exchange: Arc<ScriptedExchange>,
        probe: ErrorProbe,
    }

    fn fixture(exchange: ScriptedExchange) -> Fixture {
        let exchange = Arc::new(exchange);
        let tokens = TokenLifecycleManager::new(
            Some(Credentials::new("app", "secret")),
            exchange.clone(),
            None,
        );
        tokens.set_tokens(OAuthTokens::new(
            "initial",
            "initial-refresh",
            Utc::now().timestamp() + 3_600,
            Some(ACCOUNT),
        ));

        let bus = EventBus::new();
        let probe = ErrorProbe::attach(&bus);
        let transport = Arc::new(RecordingTransport::new());
        let session = Session::new(ACCOUNT, transport.clone(), tokens, bus);

        Fixture {
            session,
            transport,
            exchange,
            probe,
        }
    }

    // Let spawned handshake tasks run to completion
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn account_auth() -> Response {
        Response::AccountAuth(AccountAuthRes {
            account_id: ACCOUNT,
        })
    }

    async fn authenticated(fx: &Fixture) {
        fx.session.connect().unwrap();
        fx.session.handle_message(&Response::ApplicationAuth);
        settle().await;
        fx.session.handle_message(&account_auth());
        assert_eq!(fx.session.status(), Authenticated);
    }

    #[test]
    fn test_transition_table() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Authenticated.can_transition_to(Disconnected));
        assert!(Error.can_transition_to(Connecting));
        assert!(!Error.can_transition_to(Disconnected));
        assert!(!Error.can_transition_to(Authenticated));
        assert!(!Disconnected.can_transition_to(Authenticated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_reaches_authenticated() {
        let fx = fixture(ScriptedExchange::granting("fresh"));

        fx.session.connect().unwrap();
        assert_eq!(fx.session.status(), Connecting);
        assert_eq!(fx.transport.sent_names(), vec!["application_auth"]);

        fx.session.handle_message(&Response::ApplicationAuth);
        settle().await;
        assert_eq!(
            fx.transport.sent_names(),
            vec!["application_auth", "account_auth"]
        );
        match fx.transport.sent().last() {
            Some(Request::AccountAuth(req)) => assert_eq!(req.access_token(), "initial"),
            other => panic!("unexpected request: {:?}", other),
        }

        fx.session.handle_message(&account_auth());
        assert_eq!(fx.session.status(), Authenticated);
        assert_eq!(
            fx.probe.statuses(),
            vec![
                StatusChange {
                    from: Disconnected,
                    to: Connecting
                },
                StatusChange {
                    from: Connecting,
                    to: Authenticated
                },
            ]
        );
        assert_eq!(fx.exchange.calls(), 0);
        assert_eq!(fx.probe.error_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_token_triggers_one_refresh_and_reauth() {
        let fx = fixture(ScriptedExchange::granting("fresh"));
        authenticated(&fx).await;

        fx.session.handle_message(&Response::Error(
            BrokerError::new("104", "access token invalid").for_account(ACCOUNT),
        ));
        assert_eq!(fx.session.status(), Connecting);
        settle().await;

        assert_eq!(fx.exchange.calls(), 1);
        assert_eq!(
            fx.exchange.last_refresh_token().as_deref(),
            Some("initial-refresh")
        );
        match fx.transport.sent().last() {
            Some(Request::AccountAuth(req)) => assert_eq!(req.access_token(), "fresh"),
            other => panic!("unexpected request: {:?}", other),
        }

        fx.session.handle_message(&account_auth());
        assert_eq!(fx.session.status(), Authenticated);
        assert_eq!(fx.probe.error_count(), 0);
        assert!(fx
            .probe
            .metrics()
            .iter()
            .any(|point| point.name == "session.refresh.success"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_token_error_in_same_cycle_requires_reauthentication() {
        let fx = fixture(ScriptedExchange::granting("fresh"));
        authenticated(&fx).await;

        let expired = Response::Error(BrokerError::new("1", "token expired"));
        fx.session.handle_message(&expired);
        settle().await;
        fx.session.handle_message(&expired);
        fx.session.handle_message(&expired);

        assert_eq!(fx.session.status(), Error);
        assert_eq!(fx.exchange.calls(), 1);
        let errors = fx.probe.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Reauthentication);
        assert!(errors[0].fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_refresh_is_reported_once() {
        let fx = fixture(ScriptedExchange::rejecting("invalid_grant", "revoked"));
        authenticated(&fx).await;

        fx.session
            .handle_message(&Response::Error(BrokerError::new("2", "not authorized")));
        settle().await;

        assert_eq!(fx.session.status(), Error);
        assert_eq!(fx.exchange.calls(), 1);
        let errors = fx.probe.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Reauthentication);
        assert!(errors[0].message.contains("invalid_grant"));
        assert_eq!(fx.transport.sent_names().last(), Some(&"account_auth"));
        assert_eq!(fx.transport.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_benign_errors_are_suppressed() {
        let fx = fixture(ScriptedExchange::granting("fresh"));
        authenticated(&fx).await;

        fx.session.handle_message(&Response::Error(BrokerError::new(
            "INVALID_REQUEST",
            "Trying to unsubscribe to a non-subscribed period",
        )));

        assert_eq!(fx.session.status(), Authenticated);
        assert_eq!(fx.probe.error_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclaimed_generic_error_is_forwarded_with_context() {
        let fx = fixture(ScriptedExchange::granting("fresh"));
        authenticated(&fx).await;

        fx.session
            .handle_message(&Response::Error(BrokerError::new("103", "already authorized")));

        assert_eq!(fx.session.status(), Authenticated);
        let errors = fx.probe.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Broker);
        assert_eq!(errors[0].code.as_deref(), Some("103"));
        assert_eq!(errors[0].code_name, Some("CH_CLIENT_ALREADY_AUTHENTICATED"));
        assert!(!errors[0].fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claimed_error_is_not_forwarded() {
        let fx = fixture(ScriptedExchange::granting("fresh"));
        authenticated(&fx).await;
        fx.session.add_handler(Arc::new(|response| {
            matches!(response, Response::Error(_))
        }));

        fx.session
            .handle_message(&Response::Error(BrokerError::new("SERVER_ERROR", "boom")));
        assert_eq!(fx.probe.error_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_loss_reports_once() {
        let fx = fixture(ScriptedExchange::granting("fresh"));
        authenticated(&fx).await;

        fx.session.on_transport_lost("connection reset");
        fx.session.on_transport_lost("connection reset");

        assert_eq!(fx.session.status(), Disconnected);
        let errors = fx.probe.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Network);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_side_account_disconnect() {
        let fx = fixture(ScriptedExchange::granting("fresh"));
        authenticated(&fx).await;

        fx.session.handle_message(&Response::AccountDisconnect { account_id: 7 });
        assert_eq!(fx.session.status(), Authenticated);

        fx.session
            .handle_message(&Response::AccountDisconnect { account_id: ACCOUNT });
        assert_eq!(fx.session.status(), Error);
        assert_eq!(fx.probe.errors()[0].kind, ErrorKind::Reauthentication);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_keeps_error_state() {
        let fx = fixture(ScriptedExchange::granting("fresh"));
        authenticated(&fx).await;
        fx.session.handle_message(&Response::AccountsTokenInvalidated {
            account_ids: vec![ACCOUNT],
            reason: "revoked".to_string(),
        });
        assert_eq!(fx.session.status(), Error);

        fx.session.disconnect();
        assert_eq!(fx.session.status(), Error);
        assert!(fx.transport.is_closed());

        // Error only leads back to connecting
        fx.session.connect().unwrap();
        assert_eq!(fx.session.status(), Connecting);
    }

    #[tokio::test]
    async fn test_connect_without_credentials() {
        let tokens =
            TokenLifecycleManager::new(None, Arc::new(ScriptedExchange::granting("x")), None);
        let bus = EventBus::new();
        let probe = ErrorProbe::attach(&bus);
        let transport = Arc::new(RecordingTransport::new());
        let session = Session::new(ACCOUNT, transport.clone(), tokens, bus);

        let err = session.connect().unwrap_err();
        assert!(matches!(err, SessionError::CredentialsUnavailable));
        assert_eq!(session.status(), Error);
        assert!(transport.sent().is_empty());
        let errors = probe.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Credentials);
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let fx = fixture(ScriptedExchange::granting("fresh"));
        fx.session.connect().unwrap();
        assert!(matches!(
            fx.session.connect(),
            Err(SessionError::AlreadyActive(Connecting))
        ));
    }

    #[test]
    fn test_dispatch_stops_at_first_claim() {
        let fx = fixture(ScriptedExchange::granting("fresh"));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        let first_id = fx.session.add_handler(Arc::new(move |_| {
            first.lock().push("first");
            true
        }));
        let second = seen.clone();
        fx.session.add_handler(Arc::new(move |_| {
            second.lock().push("second");
            true
        }));

        fx.session.handle_message(&Response::Heartbeat);
        assert!(seen.lock().is_empty());

        let other_account = Response::AccountAuth(AccountAuthRes { account_id: 7 });
        fx.session.handle_message(&other_account);
        assert_eq!(*seen.lock(), vec!["first"]);

        assert!(fx.session.remove_handler(first_id));
        assert!(!fx.session.remove_handler(first_id));
        fx.session.handle_message(&other_account);
        assert_eq!(*seen.lock(), vec!["first", "second"]);
    }
}

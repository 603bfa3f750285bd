use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant, MissedTickBehavior};

use super::api::{CreateSubscriptionRequest, SubscriptionCondition, SubscriptionData, Transport};
use super::auth::TokenStore;
use super::error::{Result, TwitchError};
use super::messages::{EventSubMessage, Frame, Session, SubscriptionInfo, TwitchEvent};
use super::websocket::{WsConnection, WsConnector};
use crate::backend::config::SessionConfig;
use crate::backend::diagnostics::MessageLog;

pub const EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";

/// Cap for the reconnect backoff exponent (1s * 2^6 = 64s)
const MAX_BACKOFF_EXPONENT: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// Bookkeeping for the live session; owned by the session task
#[derive(Debug, Clone)]
pub struct EventSubSessionState {
    pub session_id: Option<String>,
    pub status: SessionStatus,
    pub keepalive_timeout: Duration,
    pub last_message_at: Instant,
    /// `metadata.message_timestamp` of the last decoded frame
    pub last_message_timestamp: Option<String>,
    pub reconnect_url: Option<String>,
}

impl EventSubSessionState {
    fn new() -> Self {
        Self {
            session_id: None,
            status: SessionStatus::Connecting,
            keepalive_timeout: Duration::from_secs(10),
            last_message_at: Instant::now(),
            last_message_timestamp: None,
            reconnect_url: None,
        }
    }

    /// Elapsed silence, if it exceeds `keepalive_timeout * tolerance`
    fn keepalive_expired(&self, tolerance: f64) -> Option<Duration> {
        let window = self.keepalive_timeout.mul_f64(tolerance);
        let silence = self.last_message_at.elapsed();
        (silence >= window).then_some(silence)
    }
}

/// What the session publishes to the rest of the application
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StatusChanged {
        status: SessionStatus,
        session_id: Option<String>,
    },
    Notification(TwitchEvent),
    Revoked(SubscriptionInfo),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub url: String,
    pub keepalive_tolerance: f64,
    pub max_reconnect_attempts: u32,
    /// Period of the keepalive deadline check
    pub tick: Duration,
    pub welcome_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            url: EVENTSUB_WS_URL.to_string(),
            keepalive_tolerance: 1.5,
            max_reconnect_attempts: 5,
            tick: Duration::from_secs(1),
            welcome_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionOptions {
    /// Falls back to the defaults when the table does not validate
    pub fn from_config(config: &SessionConfig) -> Self {
        if let Err(e) = config.validate() {
            log::warn!("Ignoring session settings: {}", e);
            return Self::default();
        }
        Self {
            keepalive_tolerance: config.keepalive_tolerance,
            max_reconnect_attempts: config.max_reconnect_attempts,
            ..Self::default()
        }
    }
}

/// One subscription the session keeps armed
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSpec {
    pub subscription_type: String,
    pub version: String,
    pub condition: SubscriptionCondition,
}

impl SubscriptionSpec {
    pub fn channel_chat_message(broadcaster_user_id: &str, user_id: &str) -> Self {
        Self {
            subscription_type: "channel.chat.message".to_string(),
            version: "1".to_string(),
            condition: SubscriptionCondition {
                broadcaster_user_id: Some(broadcaster_user_id.to_string()),
                user_id: Some(user_id.to_string()),
                ..Default::default()
            },
        }
    }

    fn request(&self, session_id: &str) -> CreateSubscriptionRequest {
        CreateSubscriptionRequest {
            subscription_type: self.subscription_type.clone(),
            version: self.version.clone(),
            condition: self.condition.clone(),
            transport: Transport::websocket(session_id),
        }
    }
}

/// The subscriptions to create for every fresh session id
pub struct SubscriptionPlan {
    tokens: Arc<TokenStore>,
    specs: Vec<SubscriptionSpec>,
}

impl SubscriptionPlan {
    pub fn new(tokens: Arc<TokenStore>, specs: Vec<SubscriptionSpec>) -> Self {
        Self { tokens, specs }
    }

    /// Create every subscription against `session_id`, continuing past failures
    pub async fn arm(&self, session_id: &str) -> Vec<SubscriptionData> {
        let mut armed = Vec::with_capacity(self.specs.len());

        for spec in &self.specs {
            match self.create(&spec.request(session_id)).await {
                Ok(subscription) => {
                    log::info!("✓ Subscribed to {} ({})", spec.subscription_type, subscription.id);
                    armed.push(subscription);
                }
                Err(e) => {
                    log::error!("✗ Failed to subscribe to {}: {}", spec.subscription_type, e);
                }
            }
        }

        armed
    }

    async fn create(&self, request: &CreateSubscriptionRequest) -> Result<SubscriptionData> {
        let token = self.tokens.access_token().await?;
        match self.tokens.helix().create_eventsub(&token, request).await {
            Err(TwitchError::Unauthorized { status: 401, .. }) => {
                log::warn!("EventSub subscription got 401, refreshing token and retrying...");
                let credentials = self.tokens.refresh().await?;
                self.tokens
                    .helix()
                    .create_eventsub(&credentials.access_token, request)
                    .await
            }
            result => result,
        }
    }
}

/// Why the connected phase ended
enum Next {
    Shutdown,
    /// Server sent `session_reconnect`; subscriptions survive on the new URL
    Migrate(String),
    /// Connection lost or keepalive expired; subscriptions die with it
    Lost(TwitchError),
}

enum Establish {
    Connected(Box<dyn WsConnection>),
    Shutdown,
    Exhausted(TwitchError),
}

enum Handoff {
    Done(Box<dyn WsConnection>, Session),
    Failed(TwitchError),
    Shutdown,
}

/// Resolves once shutdown was requested or the handle was dropped
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Open a connection and wait for its `session_welcome`. Anything else first
/// fails the attempt.
async fn open_session(
    connector: &dyn WsConnector,
    url: &str,
    welcome_timeout: Duration,
) -> Result<(Box<dyn WsConnection>, Session)> {
    let mut connection = connector.connect(url).await?;

    match await_welcome(connection.as_mut(), welcome_timeout).await {
        Ok(session) => Ok((connection, session)),
        Err(e) => {
            let _ = connection.close().await;
            Err(e)
        }
    }
}

async fn await_welcome(connection: &mut dyn WsConnection, welcome_timeout: Duration) -> Result<Session> {
    let text = timeout(welcome_timeout, connection.next_text())
        .await
        .map_err(|_| {
            TwitchError::ProtocolViolation(format!(
                "no session_welcome within {:?}",
                welcome_timeout
            ))
        })??
        .ok_or_else(|| {
            TwitchError::WebSocketError("connection closed before session_welcome".to_string())
        })?;

    match EventSubMessage::parse(&text)?.into_frame()? {
        Frame::Welcome(session) if session.keepalive_timeout_seconds.is_some() => Ok(session),
        Frame::Welcome(_) => Err(TwitchError::ProtocolViolation(
            "session_welcome without keepalive_timeout_seconds".to_string(),
        )),
        other => Err(TwitchError::ProtocolViolation(format!(
            "expected session_welcome, got {:?}",
            other
        ))),
    }
}

fn backoff_delay(retry: u32) -> Duration {
    Duration::from_secs(1) * 2_u32.pow(retry.saturating_sub(1).min(MAX_BACKOFF_EXPONENT))
}

/// EventSub websocket session state machine.
///
/// Connecting -> Connected -> Reconnecting -> Connected | Disconnected.
/// `Disconnected` is terminal; a new session has to be built to resume.
pub struct EventSubSession {
    connector: Arc<dyn WsConnector>,
    plan: SubscriptionPlan,
    options: SessionOptions,
    state: EventSubSessionState,
    subscriptions: Vec<SubscriptionData>,
    events: mpsc::UnboundedSender<SessionEvent>,
    log: MessageLog,
}

impl EventSubSession {
    pub fn new(
        connector: Arc<dyn WsConnector>,
        plan: SubscriptionPlan,
        options: SessionOptions,
        events: mpsc::UnboundedSender<SessionEvent>,
        log: MessageLog,
    ) -> Self {
        Self {
            connector,
            plan,
            options,
            state: EventSubSessionState::new(),
            subscriptions: Vec::new(),
            events,
            log,
        }
    }

    /// Run the session on its own task
    pub fn spawn(self) -> SessionHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        SessionHandle { shutdown_tx, task }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SessionReport {
        self.set_status(SessionStatus::Connecting);

        let url = self.options.url.clone();
        let mut connection = match self.establish(&url, &mut shutdown).await {
            Establish::Connected(connection) => connection,
            Establish::Shutdown => return self.finish(),
            Establish::Exhausted(e) => {
                self.log
                    .error(format!("EventSub connection failed, giving up: {}", e));
                return self.finish();
            }
        };

        loop {
            match self.pump(connection.as_mut(), &mut shutdown).await {
                Next::Shutdown => {
                    if let Err(e) = connection.close().await {
                        log::warn!("Failed to close EventSub connection: {}", e);
                    }
                    break;
                }
                Next::Migrate(url) => {
                    self.set_status(SessionStatus::Reconnecting);

                    match self.handoff(connection.as_mut(), url, &mut shutdown).await {
                        Handoff::Done(next, session) => {
                            // The new session is live, only now release the old one
                            let _ = connection.close().await;
                            connection = next;
                            self.on_welcome(session);
                        }
                        Handoff::Shutdown => {
                            let _ = connection.close().await;
                            break;
                        }
                        Handoff::Failed(e) => {
                            self.log.warning(format!(
                                "EventSub reconnect handoff failed, starting a fresh session: {}",
                                e
                            ));
                            let _ = connection.close().await;
                            match self.reestablish(&mut shutdown).await {
                                Some(next) => connection = next,
                                None => break,
                            }
                        }
                    }
                }
                Next::Lost(e) => {
                    self.log.warning(format!("EventSub connection lost: {}", e));
                    self.set_status(SessionStatus::Reconnecting);
                    let _ = connection.close().await;

                    match self.reestablish(&mut shutdown).await {
                        Some(next) => connection = next,
                        None => break,
                    }
                }
            }
        }

        self.finish()
    }

    /// Fresh connection against the default endpoint after the old one died.
    /// Subscriptions held for the dead session are discarded and re-created.
    async fn reestablish(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Box<dyn WsConnection>> {
        self.subscriptions.clear();
        self.state.reconnect_url = None;

        let url = self.options.url.clone();
        match self.establish(&url, shutdown).await {
            Establish::Connected(connection) => Some(connection),
            Establish::Shutdown => None,
            Establish::Exhausted(e) => {
                self.log
                    .error(format!("EventSub reconnection attempts exhausted: {}", e));
                None
            }
        }
    }

    /// Connect with exponential backoff, then arm the subscription plan
    async fn establish(&mut self, url: &str, shutdown: &mut watch::Receiver<bool>) -> Establish {
        let mut last_error =
            TwitchError::WebSocketError("no connection attempts allowed".to_string());

        for attempt in 1..=self.options.max_reconnect_attempts {
            if attempt > 1 {
                let delay = backoff_delay(attempt - 1);
                log::info!("Retrying EventSub connection in {:?}", delay);
                tokio::select! {
                    _ = cancelled(shutdown) => return Establish::Shutdown,
                    _ = sleep(delay) => {}
                }
            }

            let opened = tokio::select! {
                _ = cancelled(shutdown) => return Establish::Shutdown,
                opened = open_session(self.connector.as_ref(), url, self.options.welcome_timeout) => opened,
            };

            match opened {
                Ok((connection, session)) => {
                    self.on_welcome(session);
                    if let Some(session_id) = self.state.session_id.clone() {
                        self.subscriptions = self.plan.arm(&session_id).await;
                    }
                    return Establish::Connected(connection);
                }
                Err(e) => {
                    log::error!("EventSub connection attempt {} failed: {}", attempt, e);
                    last_error = e;
                }
            }
        }

        Establish::Exhausted(last_error)
    }

    /// Connected phase: dispatch frames and watch the keepalive deadline
    async fn pump(
        &mut self,
        connection: &mut dyn WsConnection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Next {
        let mut tick = tokio::time::interval(self.options.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancelled(shutdown) => return Next::Shutdown,
                frame = connection.next_text() => match frame {
                    Ok(Some(text)) => {
                        if let Some(next) = self.on_text(&text) {
                            return next;
                        }
                    }
                    Ok(None) => {
                        return Next::Lost(TwitchError::WebSocketError(
                            "connection closed by server".to_string(),
                        ));
                    }
                    Err(e) => return Next::Lost(e),
                },
                _ = tick.tick() => {
                    if let Some(silence) = self.state.keepalive_expired(self.options.keepalive_tolerance) {
                        return Next::Lost(TwitchError::KeepaliveTimeout(silence));
                    }
                }
            }
        }
    }

    /// Reconnecting phase after `session_reconnect`: keep serving the old
    /// connection until the new one has been welcomed
    async fn handoff(
        &mut self,
        old: &mut dyn WsConnection,
        url: String,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Handoff {
        let connector = self.connector.clone();
        let welcome_timeout = self.options.welcome_timeout;
        let opening = async move { open_session(connector.as_ref(), &url, welcome_timeout).await };
        tokio::pin!(opening);

        let mut old_open = true;
        loop {
            tokio::select! {
                _ = cancelled(shutdown) => return Handoff::Shutdown,
                opened = &mut opening => {
                    return match opened {
                        Ok((connection, session)) => Handoff::Done(connection, session),
                        Err(e) => Handoff::Failed(e),
                    };
                }
                frame = old.next_text(), if old_open => match frame {
                    Ok(Some(text)) => {
                        // Already migrating, further instructions are moot
                        let _ = self.on_text(&text);
                    }
                    Ok(None) | Err(_) => old_open = false,
                },
            }
        }
    }

    fn on_welcome(&mut self, session: Session) {
        self.state.session_id = Some(session.id);
        if let Some(seconds) = session.keepalive_timeout_seconds {
            self.state.keepalive_timeout = Duration::from_secs(seconds);
        }
        self.state.last_message_at = Instant::now();
        self.state.reconnect_url = None;
        self.set_status(SessionStatus::Connected);
    }

    /// Handle one inbound frame while connected. Malformed frames are logged
    /// and dropped, except a broken `session_reconnect`, which ends the session.
    fn on_text(&mut self, text: &str) -> Option<Next> {
        self.state.last_message_at = Instant::now();

        let message = match EventSubMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Ignoring malformed EventSub frame: {}", e);
                return None;
            }
        };

        log::debug!("Received message type: {}", message.metadata.message_type);
        self.state.last_message_timestamp = Some(message.metadata.message_timestamp.clone());
        let message_type = message.metadata.message_type.clone();

        let frame = match message.into_frame() {
            Ok(frame) => frame,
            Err(e) if message_type == "session_reconnect" => {
                return Some(Next::Lost(TwitchError::ProtocolViolation(format!(
                    "malformed session_reconnect: {}",
                    e
                ))));
            }
            Err(e) => {
                log::warn!("Ignoring malformed {} frame: {}", message_type, e);
                return None;
            }
        };

        match frame {
            Frame::Keepalive => {}
            Frame::Notification(notification) => match notification.into_event() {
                Ok(event) => self.emit(SessionEvent::Notification(event)),
                Err(e) => log::warn!("Ignoring notification: {}", e),
            },
            Frame::Reconnect(session) => match session.reconnect_url {
                Some(url) => {
                    log::warn!("Server requested reconnect to: {}", url);
                    self.state.reconnect_url = Some(url.clone());
                    return Some(Next::Migrate(url));
                }
                None => {
                    return Some(Next::Lost(TwitchError::ProtocolViolation(
                        "session_reconnect without reconnect_url".to_string(),
                    )));
                }
            },
            Frame::Revocation(subscription) => {
                self.log.warning(format!(
                    "Subscription {} ({}) revoked: {}",
                    subscription.id, subscription.subscription_type, subscription.status
                ));
                self.subscriptions.retain(|s| s.id != subscription.id);
                self.emit(SessionEvent::Revoked(subscription));
            }
            Frame::Welcome(_) => {
                log::warn!("Ignoring session_welcome on an established session");
            }
            Frame::Unknown(message_type) => {
                log::debug!("Ignoring EventSub message type {}", message_type);
            }
        }

        None
    }

    fn set_status(&mut self, status: SessionStatus) {
        self.state.status = status;
        self.log.info(format!(
            "EventSub session {:?}{}",
            status,
            self.state
                .session_id
                .as_deref()
                .map(|id| format!(" ({})", id))
                .unwrap_or_default()
        ));
        self.emit(SessionEvent::StatusChanged {
            status,
            session_id: self.state.session_id.clone(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        // Fire-and-forget: nobody listening is not an error
        let _ = self.events.send(event);
    }

    fn finish(mut self) -> SessionReport {
        self.set_status(SessionStatus::Disconnected);
        SessionReport {
            state: self.state,
            subscriptions: self.subscriptions,
        }
    }
}

/// Final state of a session once its task has ended
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub state: EventSubSessionState,
    pub subscriptions: Vec<SubscriptionData>,
}

pub struct SessionHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<SessionReport>,
}

impl SessionHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the session, closing its websocket, and wait for the task
    pub async fn shutdown(self) -> Result<SessionReport> {
        let _ = self.shutdown_tx.send(true);
        self.join().await
    }

    /// Wait for the session to end on its own
    pub async fn join(self) -> Result<SessionReport> {
        self.task
            .await
            .map_err(|e| TwitchError::ChannelError(format!("EventSub task failed: {}", e)))
    }
}

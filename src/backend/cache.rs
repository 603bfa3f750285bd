use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::backend::config::{Config, ConfigSource};
use crate::backend::diagnostics::MessageLog;
use crate::backend::twitch::{
    Credentials, HelixClient, HttpTransport, Result, TokenStore, TwitchError, UserData,
};

type InitFuture<T> = Shared<BoxFuture<'static, Option<Arc<T>>>>;

enum SlotState<T> {
    Empty,
    Pending(InitFuture<T>),
    Ready(Arc<T>),
    Failed,
}

struct SlotInner<T> {
    /// Bumped on every invalidation so a stale in-flight init cannot
    /// overwrite the cleared slot
    generation: u64,
    state: SlotState<T>,
}

/// Lazily initialized, single-flight cell.
///
/// The first caller starts the initializer; callers arriving while it runs
/// await the same shared future. Failure is terminal until `invalidate`.
pub struct Slot<T> {
    name: &'static str,
    log: MessageLog,
    inner: Mutex<SlotInner<T>>,
}

impl<T: Send + Sync + 'static> Slot<T> {
    pub fn new(name: &'static str, log: MessageLog) -> Self {
        Self {
            name,
            log,
            inner: Mutex::new(SlotInner {
                generation: 0,
                state: SlotState::Empty,
            }),
        }
    }

    pub async fn get_or_init<F, Fut>(&self, init: F) -> Option<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (generation, pending) = {
            let mut inner = self.inner.lock().await;
            let in_flight = match &inner.state {
                SlotState::Ready(value) => return Some(value.clone()),
                SlotState::Failed => return None,
                SlotState::Pending(pending) => Some(pending.clone()),
                SlotState::Empty => None,
            };

            let pending = match in_flight {
                Some(pending) => pending,
                None => {
                    let name = self.name;
                    let log = self.log.clone();
                    let pending = init()
                        .map(move |result| match result {
                            Ok(value) => {
                                log.info(format!("Resolved {}", name));
                                Some(Arc::new(value))
                            }
                            Err(e) => {
                                log.error(format!("Failed to resolve {}: {}", name, e));
                                None
                            }
                        })
                        .boxed()
                        .shared();
                    inner.state = SlotState::Pending(pending.clone());
                    pending
                }
            };
            (inner.generation, pending)
        };

        let outcome = pending.await;

        let mut inner = self.inner.lock().await;
        if inner.generation == generation && matches!(inner.state, SlotState::Pending(_)) {
            inner.state = match &outcome {
                Some(value) => SlotState::Ready(value.clone()),
                None => SlotState::Failed,
            };
        }
        outcome
    }

    /// Current value without initializing
    pub async fn peek(&self) -> Option<Arc<T>> {
        match &self.inner.lock().await.state {
            SlotState::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Forget the value or failure; the next `get_or_init` starts over
    pub async fn invalidate(&self) {
        let mut inner = self.inner.lock().await;
        inner.generation += 1;
        inner.state = SlotState::Empty;
    }
}

struct Inner {
    config_source: Arc<dyn ConfigSource>,
    transport: Arc<dyn HttpTransport>,
    log: MessageLog,
    token_refresh_tx: Option<mpsc::UnboundedSender<Credentials>>,
    authorization_code: StdMutex<Option<String>>,
    /// Latest refresh token of a store that has since been invalidated.
    /// Newer than the one in the config, which is only read once.
    rotated_refresh_token: StdMutex<Option<String>>,
    refresh_timer: StdMutex<Option<(Weak<TokenStore>, JoinHandle<()>)>>,
    config: Slot<Config>,
    tokens: Slot<TokenStore>,
    broadcaster: Slot<UserData>,
    bot: Slot<UserData>,
}

/// Process-wide resources, resolved on first use and shared afterwards.
/// Cloning is cheap; every clone sees the same slots.
#[derive(Clone)]
pub struct AppCache {
    inner: Arc<Inner>,
}

impl AppCache {
    pub fn new(
        config_source: Arc<dyn ConfigSource>,
        transport: Arc<dyn HttpTransport>,
        log: MessageLog,
        token_refresh_tx: Option<mpsc::UnboundedSender<Credentials>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config_source,
                transport,
                token_refresh_tx,
                authorization_code: StdMutex::new(None),
                rotated_refresh_token: StdMutex::new(None),
                refresh_timer: StdMutex::new(None),
                config: Slot::new("configuration", log.clone()),
                tokens: Slot::new("credentials", log.clone()),
                broadcaster: Slot::new("broadcaster identity", log.clone()),
                bot: Slot::new("bot identity", log.clone()),
                log,
            }),
        }
    }

    pub fn log(&self) -> &MessageLog {
        &self.inner.log
    }

    pub async fn config(&self) -> Option<Arc<Config>> {
        let source = self.inner.config_source.clone();
        self.inner
            .config
            .get_or_init(move || async move { source.load() })
            .await
    }

    /// Authenticated token store. The first successful resolution starts the
    /// proactive refresh timer.
    pub async fn tokens(&self) -> Option<Arc<TokenStore>> {
        let cache = self.clone();
        let tokens = self
            .inner
            .tokens
            .get_or_init(move || cache.init_tokens())
            .await?;
        self.ensure_refresh_timer(&tokens);
        Some(tokens)
    }

    pub async fn broadcaster(&self) -> Option<Arc<UserData>> {
        let cache = self.clone();
        self.inner
            .broadcaster
            .get_or_init(move || cache.init_broadcaster())
            .await
    }

    pub async fn bot(&self) -> Option<Arc<UserData>> {
        let cache = self.clone();
        self.inner
            .bot
            .get_or_init(move || cache.init_bot())
            .await
    }

    /// Hand over a code from the OAuth redirect. It is exchanged the next
    /// time credentials are resolved.
    pub async fn provide_authorization_code(&self, code: &str) {
        *lock(&self.inner.authorization_code) = Some(code.to_string());
        self.invalidate_tokens().await;
        self.inner.bot.invalidate().await;
        self.inner.broadcaster.invalidate().await;
    }

    pub async fn invalidate_config(&self) {
        self.inner.config.invalidate().await;
    }

    pub async fn invalidate_tokens(&self) {
        if let Some(tokens) = self.inner.tokens.peek().await {
            let refresh_token = tokens.credentials().await.refresh_token;
            *lock(&self.inner.rotated_refresh_token) = Some(refresh_token);
        }
        self.inner.tokens.invalidate().await;
        self.stop_refresh_timer();
    }

    pub async fn invalidate_broadcaster(&self) {
        self.inner.broadcaster.invalidate().await;
    }

    pub async fn invalidate_bot(&self) {
        self.inner.bot.invalidate().await;
    }

    pub fn shutdown(&self) {
        self.stop_refresh_timer();
    }

    async fn require_config(&self) -> Result<Arc<Config>> {
        self.config()
            .await
            .ok_or_else(|| TwitchError::ConfigMissing("configuration unavailable".to_string()))
    }

    async fn require_tokens(&self) -> Result<Arc<TokenStore>> {
        self.tokens()
            .await
            .ok_or_else(|| TwitchError::ConfigMissing("credentials unavailable".to_string()))
    }

    async fn init_tokens(self) -> Result<TokenStore> {
        let config = self.require_config().await?;
        let helix = HelixClient::new(
            self.inner.transport.clone(),
            &config.client_id,
            &config.client_secret,
        );

        let code = lock(&self.inner.authorization_code).take();
        let seed = lock(&self.inner.rotated_refresh_token)
            .clone()
            .or_else(|| config.refresh_token.clone());
        let response = match (code, seed.as_deref()) {
            (Some(code), _) => helix.get_access_token(&code, &config.redirect_uri).await?,
            (None, Some(refresh_token)) => helix.refresh_access_token(refresh_token).await?,
            (None, None) => {
                return Err(TwitchError::ConfigMissing(
                    "no refresh_token configured and no authorization code provided".to_string(),
                ));
            }
        };

        let credentials = Credentials::from_response(response, Utc::now())?;
        let margin = Duration::from_secs(config.session.refresh_margin_secs);
        let mut store = TokenStore::new(helix, credentials.clone(), margin);

        if let Some(tx) = &self.inner.token_refresh_tx {
            let _ = tx.send(credentials);
            store = store.with_refresh_notifier(tx.clone());
        }

        Ok(store)
    }

    async fn init_broadcaster(self) -> Result<UserData> {
        let config = self.require_config().await?;
        let tokens = self.require_tokens().await?;
        self.lookup_user(&tokens, Some(&config.broadcaster_login))
            .await
    }

    async fn init_bot(self) -> Result<UserData> {
        let config = self.require_config().await?;
        let tokens = self.require_tokens().await?;
        self.lookup_user(&tokens, config.bot_login.as_deref()).await
    }

    /// User by login, or the token owner when no login is given
    async fn lookup_user(&self, tokens: &TokenStore, login: Option<&str>) -> Result<UserData> {
        let token = tokens.access_token().await?;
        let logins: Vec<&str> = login.into_iter().collect();
        let users = tokens.helix().get_users(&token, &[], &logins).await?;

        users.into_iter().next().ok_or_else(|| {
            TwitchError::UserNotFound(login.unwrap_or("<token owner>").to_string())
        })
    }

    fn ensure_refresh_timer(&self, tokens: &Arc<TokenStore>) {
        let mut timer = lock(&self.inner.refresh_timer);
        if let Some((store, _)) = timer.as_ref() {
            if Weak::ptr_eq(store, &Arc::downgrade(tokens)) {
                return;
            }
        }
        if let Some((_, handle)) = timer.take() {
            handle.abort();
        }
        *timer = Some((Arc::downgrade(tokens), tokens.spawn_refresh_timer()));
    }

    fn stop_refresh_timer(&self) {
        if let Some((_, handle)) = lock(&self.inner.refresh_timer).take() {
            handle.abort();
        }
    }
}

/// Poisoning only means another thread panicked mid-update of a plain value
fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::config::SessionConfig;
    use crate::backend::twitch::api::{TOKEN_URL, USERS_URL};
    use crate::backend::twitch::transport::fake::FakeTransport;
    use crate::backend::twitch::transport::Method;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOKENS: &str = r#"{"access_token":"access","refresh_token":"rotated","expires_in":14400,"scope":["user:write:chat"],"token_type":"bearer"}"#;
    const STREAMER: &str = r#"{"data":[{"id":"100","login":"streamer","display_name":"Streamer","type":"","broadcaster_type":"partner","description":"","created_at":"2016-12-14T20:32:28Z"}]}"#;
    const OWNER: &str = r#"{"data":[{"id":"200","login":"botaccount","display_name":"BotAccount","type":"","broadcaster_type":"","description":"","created_at":"2020-01-01T00:00:00Z"}]}"#;

    fn config(refresh_token: Option<&str>) -> Config {
        Config {
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            broadcaster_login: "streamer".to_string(),
            redirect_uri: "http://localhost:3000".to_string(),
            scopes: vec!["user:write:chat".to_string()],
            bot_login: None,
            refresh_token: refresh_token.map(str::to_string),
            session: SessionConfig::default(),
        }
    }

    fn routed_transport() -> Arc<FakeTransport> {
        let transport = FakeTransport::new();
        transport.route(Method::Post, TOKEN_URL, 200, TOKENS);
        transport.route(Method::Get, &format!("{}?login=streamer", USERS_URL), 200, STREAMER);
        transport.route(Method::Get, USERS_URL, 200, OWNER);
        transport
    }

    struct CountingSource {
        loads: AtomicUsize,
    }

    impl ConfigSource for CountingSource {
        fn load(&self) -> Result<Config> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Err(TwitchError::ConfigMissing("config.toml not found".to_string()))
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_initialization() {
        let transport = routed_transport();
        transport.set_delay(std::time::Duration::from_millis(20));
        let cache = AppCache::new(
            Arc::new(config(Some("seed"))),
            transport.clone(),
            MessageLog::new(),
            None,
        );

        let (a, b, c) = tokio::join!(cache.broadcaster(), cache.broadcaster(), cache.broadcaster());
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(a.id, "100");
        assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
        assert_eq!(transport.count(Method::Post, TOKEN_URL), 1);
        assert_eq!(transport.count(Method::Get, USERS_URL), 1);

        cache.shutdown();
    }

    #[tokio::test]
    async fn test_failure_is_cached_until_invalidated() {
        let source = Arc::new(CountingSource {
            loads: AtomicUsize::new(0),
        });
        let cache = AppCache::new(source.clone(), FakeTransport::new(), MessageLog::new(), None);

        assert!(cache.config().await.is_none());
        assert!(cache.config().await.is_none());
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        cache.invalidate_config().await;
        assert!(cache.config().await.is_none());
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_is_reported_to_observers() {
        let source = Arc::new(CountingSource {
            loads: AtomicUsize::new(0),
        });
        let log = MessageLog::new();
        let mut observer = log.subscribe();
        let cache = AppCache::new(source, FakeTransport::new(), log, None);

        assert!(cache.bot().await.is_none());

        let entry = observer.recv().await.unwrap();
        assert_eq!(entry.level, crate::backend::diagnostics::LogLevel::Error);
        assert!(entry.message.contains("configuration"));
    }

    #[tokio::test]
    async fn test_bot_defaults_to_token_owner() {
        let transport = routed_transport();
        let cache = AppCache::new(Arc::new(config(Some("seed"))), transport.clone(), MessageLog::new(), None);

        let bot = cache.bot().await.unwrap();
        assert_eq!(bot.login, "botaccount");

        let lookup = transport
            .requests()
            .into_iter()
            .find(|r| r.method == Method::Get)
            .unwrap();
        assert_eq!(lookup.url, USERS_URL);
        assert_eq!(lookup.header_value("Authorization"), Some("Bearer access"));

        cache.shutdown();
    }

    #[tokio::test]
    async fn test_authorization_code_replaces_missing_refresh_token() {
        let transport = routed_transport();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cache = AppCache::new(Arc::new(config(None)), transport.clone(), MessageLog::new(), Some(tx));

        assert!(cache.tokens().await.is_none());
        assert_eq!(transport.count(Method::Post, TOKEN_URL), 0);

        cache.provide_authorization_code("abc123").await;
        let tokens = cache.tokens().await.unwrap();
        assert_eq!(tokens.credentials().await.refresh_token, "rotated");

        let exchange = transport.requests().pop().unwrap();
        let body = exchange.body.unwrap();
        assert!(body.contains("code=abc123"));
        assert!(body.contains("grant_type=authorization_code"));

        assert_eq!(rx.recv().await.unwrap().refresh_token, "rotated");
        cache.shutdown();
    }

    #[tokio::test]
    async fn test_reseeding_uses_the_rotated_refresh_token() {
        let transport = routed_transport();
        let cache = AppCache::new(Arc::new(config(Some("seed"))), transport.clone(), MessageLog::new(), None);

        cache.tokens().await.unwrap();
        cache.invalidate_tokens().await;
        cache.tokens().await.unwrap();

        let seeds: Vec<String> = transport
            .requests()
            .into_iter()
            .filter(|r| r.method == Method::Post && r.url == TOKEN_URL)
            .map(|r| r.body.unwrap_or_default())
            .collect();
        assert_eq!(seeds.len(), 2);
        assert!(seeds[0].contains("refresh_token=seed"));
        assert!(seeds[1].contains("refresh_token=rotated"));
        cache.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_broadcaster_is_a_failure() {
        let transport = FakeTransport::new();
        transport.route(Method::Post, TOKEN_URL, 200, TOKENS);
        transport.route(Method::Get, USERS_URL, 200, r#"{"data":[]}"#);
        let cache = AppCache::new(Arc::new(config(Some("seed"))), transport, MessageLog::new(), None);

        assert!(cache.broadcaster().await.is_none());
        assert!(cache.tokens().await.is_some());
        cache.shutdown();
    }

    #[tokio::test]
    async fn test_invalidate_during_init_discards_stale_result() {
        let slot: Arc<Slot<u32>> = Arc::new(Slot::new("number", MessageLog::new()));

        let first = {
            let slot = slot.clone();
            tokio::spawn(async move {
                slot.get_or_init(|| async {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    Ok(1)
                })
                .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        slot.invalidate().await;

        assert_eq!(first.await.unwrap().as_deref(), Some(&1));
        assert!(slot.peek().await.is_none());
        assert_eq!(slot.get_or_init(|| async { Ok(2) }).await.as_deref(), Some(&2));
    }
}

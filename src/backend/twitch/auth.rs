use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use super::api::{join_query, HelixClient};
use super::error::{Result, TwitchError};

const AUTHORIZE_URL: &str = "https://id.twitch.tv/oauth2/authorize";

/// Delay before retrying a scheduled refresh that failed
const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Floor for the refresh timer, even for tokens that are already due
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Response from the authorization_code and refresh_token grants
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Vec<String>,
    pub token_type: String,
}

/// Response from the client_credentials grant
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppTokenResponse {
    pub access_token: String,
    pub expires_in: u64,
    pub token_type: String,
}

/// User access token pair plus its expiry. Access and refresh token are
/// always replaced together.
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    pub fn from_response(response: TokenResponse, now: DateTime<Utc>) -> Result<Self> {
        let expires_at = i64::try_from(response.expires_in)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| {
                TwitchError::MalformedPayload(format!(
                    "expires_in out of range: {}",
                    response.expires_in
                ))
            })?;

        Ok(Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            issued_at: now,
            expires_at,
        })
    }

    /// The configured margin, capped at half the token lifetime so a short
    /// lived token is not due for refresh the moment it is issued
    fn effective_margin(&self, margin: Duration) -> TimeDelta {
        let margin = TimeDelta::from_std(margin).unwrap_or(TimeDelta::MAX);
        let half_lifetime = (self.expires_at - self.issued_at) / 2;
        margin.min(half_lifetime).max(TimeDelta::zero())
    }

    /// True once `now` is inside the safety margin before expiry
    pub fn needs_refresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        now + self.effective_margin(margin) >= self.expires_at
    }

    /// Time left until the refresh point `expires_at - margin`
    pub fn time_until_refresh(&self, margin: Duration, now: DateTime<Utc>) -> Duration {
        (self.expires_at - self.effective_margin(margin) - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Build the URL the user opens in a browser to authorize the bot
pub fn authorize_url(
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    force_verify: bool,
    state: Option<&str>,
) -> String {
    let scope = scopes.join(" ");
    let force_verify = force_verify.to_string();
    let query = join_query(
        [
            ("client_id", client_id),
            ("force_verify", force_verify.as_str()),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", scope.as_str()),
        ]
        .into_iter()
        .chain(state.map(|state| ("state", state))),
    );
    format!("{}?{}", AUTHORIZE_URL, query)
}

/// Owner of the user credentials.
///
/// Readers take the read lock; a refresh holds the write lock for the whole
/// token request, so a caller arriving mid-refresh waits for the new pair
/// instead of using the stale one.
pub struct TokenStore {
    helix: HelixClient,
    credentials: RwLock<Credentials>,
    refresh_margin: Duration,
    token_refresh_tx: Option<mpsc::UnboundedSender<Credentials>>,
}

impl TokenStore {
    pub fn new(helix: HelixClient, credentials: Credentials, refresh_margin: Duration) -> Self {
        Self {
            helix,
            credentials: RwLock::new(credentials),
            refresh_margin,
            token_refresh_tx: None,
        }
    }

    /// Set a channel to receive the new pair every time tokens are refreshed
    pub fn with_refresh_notifier(mut self, tx: mpsc::UnboundedSender<Credentials>) -> Self {
        self.token_refresh_tx = Some(tx);
        self
    }

    pub fn helix(&self) -> &HelixClient {
        &self.helix
    }

    pub async fn credentials(&self) -> Credentials {
        self.credentials.read().await.clone()
    }

    /// Current access token, refreshed first if it is inside the safety margin
    pub async fn access_token(&self) -> Result<String> {
        {
            let credentials = self.credentials.read().await;
            if !credentials.needs_refresh(self.refresh_margin, Utc::now()) {
                return Ok(credentials.access_token.clone());
            }
        }

        let mut credentials = self.credentials.write().await;
        // Another caller may have refreshed while we waited for the lock
        if !credentials.needs_refresh(self.refresh_margin, Utc::now()) {
            return Ok(credentials.access_token.clone());
        }
        self.refresh_locked(&mut credentials).await?;
        Ok(credentials.access_token.clone())
    }

    /// Refresh unconditionally
    pub async fn refresh(&self) -> Result<Credentials> {
        let mut credentials = self.credentials.write().await;
        self.refresh_locked(&mut credentials).await?;
        Ok(credentials.clone())
    }

    /// Refresh only if nobody replaced the pair that expires at `expected`
    async fn refresh_if_unchanged(&self, expected: DateTime<Utc>) -> Result<()> {
        let mut credentials = self.credentials.write().await;
        if credentials.expires_at != expected {
            return Ok(());
        }
        self.refresh_locked(&mut credentials).await
    }

    async fn refresh_locked(&self, credentials: &mut Credentials) -> Result<()> {
        let response = self
            .helix
            .refresh_access_token(&credentials.refresh_token)
            .await?;
        *credentials = Credentials::from_response(response, Utc::now())?;

        log::info!(
            "Access token refreshed, expires at {}",
            credentials.expires_at.to_rfc3339()
        );

        if let Some(tx) = &self.token_refresh_tx {
            let _ = tx.send(credentials.clone());
        }

        Ok(())
    }

    /// Spawn the proactive refresh timer. It wakes at `expires_at - margin`,
    /// refreshes, and reschedules itself. The task ends once the store is dropped.
    pub fn spawn_refresh_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let (expires_at, wait) = match store.upgrade() {
                    Some(store) => {
                        let credentials = store.credentials().await;
                        let wait = credentials
                            .time_until_refresh(store.refresh_margin, Utc::now())
                            .max(MIN_REFRESH_INTERVAL);
                        (credentials.expires_at, wait)
                    }
                    None => break,
                };

                tokio::time::sleep(wait).await;

                let Some(store) = store.upgrade() else {
                    break;
                };
                if let Err(e) = store.refresh_if_unchanged(expires_at).await {
                    log::error!("Scheduled token refresh failed: {}", e);
                    drop(store);
                    tokio::time::sleep(REFRESH_RETRY_DELAY).await;
                }
            }
        })
    }
}

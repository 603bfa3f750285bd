use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::auth::{AppTokenResponse, TokenResponse};
use super::error::{Result, TwitchError};
use super::transport::{HttpRequest, HttpResponse, HttpTransport, Method};

pub const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
pub const USERS_URL: &str = "https://api.twitch.tv/helix/users";
pub const EVENTSUB_API_URL: &str = "https://api.twitch.tv/helix/eventsub/subscriptions";
pub const CHAT_MESSAGES_URL: &str = "https://api.twitch.tv/helix/chat/messages";

/// User info response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UsersResponse {
    pub data: Vec<UserData>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UserData {
    pub id: String,
    pub login: String,
    pub display_name: String,
    #[serde(rename = "type", default)]
    pub user_type: String,
    #[serde(default)]
    pub broadcaster_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub profile_image_url: Option<String>,
    #[serde(default)]
    pub offline_image_url: Option<String>,
    #[serde(default)]
    pub view_count: Option<u64>,
    #[serde(default)]
    pub email: Option<String>,
    pub created_at: String,
}

/// Condition object of an EventSub subscription. Only the keys relevant to the
/// subscription type are set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SubscriptionCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcaster_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderator_user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transport {
    pub method: String,
    pub session_id: String,
}

impl Transport {
    pub fn websocket(session_id: &str) -> Self {
        Self {
            method: "websocket".to_string(),
            session_id: session_id.to_string(),
        }
    }
}

/// EventSub subscription request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateSubscriptionRequest {
    #[serde(rename = "type")]
    pub subscription_type: String,
    pub version: String,
    pub condition: SubscriptionCondition,
    pub transport: Transport,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionList {
    pub data: Vec<SubscriptionData>,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub total_cost: u32,
    #[serde(default)]
    pub max_total_cost: u32,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pagination {
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionData {
    pub id: String,
    #[serde(rename = "type")]
    pub subscription_type: String,
    pub version: String,
    pub status: String,
    #[serde(default)]
    pub cost: u32,
    #[serde(default)]
    pub condition: SubscriptionCondition,
    pub created_at: String,
    pub transport: TransportData,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransportData {
    pub method: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Filter for listing EventSub subscriptions. Helix accepts one of these at a
/// time; when several are set, `status` wins over `subscription_type`, which
/// wins over `user_id`.
#[derive(Debug, Clone, Default)]
pub struct EventSubFilter {
    pub status: Option<String>,
    pub subscription_type: Option<String>,
    pub user_id: Option<String>,
}

impl EventSubFilter {
    fn query_pair(&self) -> Option<(&'static str, &str)> {
        if let Some(status) = &self.status {
            Some(("status", status))
        } else if let Some(subscription_type) = &self.subscription_type {
            Some(("type", subscription_type))
        } else {
            self.user_id.as_deref().map(|user_id| ("user_id", user_id))
        }
    }
}

/// Body of a Send Chat Message request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendChatMessageRequest {
    pub broadcaster_id: String,
    pub sender_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_parent_message_id: Option<String>,
}

/// Response from sending a chat message
#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageResponse {
    pub data: Vec<SendMessageData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageData {
    pub message_id: String,
    pub is_sent: bool,
    pub drop_reason: Option<DropReason>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DropReason {
    pub code: String,
    pub message: String,
}

/// Joins `key=value` pairs with `&`, URL-encoding each value and keeping the
/// caller's order.
pub fn join_query<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn with_query(base: &str, query: &str) -> String {
    if query.is_empty() {
        base.to_string()
    } else {
        format!("{}?{}", base, query)
    }
}

/// Stateless Helix and OAuth client.
///
/// Every operation takes the token it should authenticate with and returns
/// either the typed payload or a `TwitchError` describing why the request
/// failed. Transport, status and decoding failures never escape any other way.
#[derive(Clone)]
pub struct HelixClient {
    transport: Arc<dyn HttpTransport>,
    client_id: String,
    client_secret: String,
}

impl HelixClient {
    pub fn new(transport: Arc<dyn HttpTransport>, client_id: &str, client_secret: &str) -> Self {
        Self {
            transport,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Exchange an authorization code for a user access token
    pub async fn get_access_token(
        &self,
        authorization_code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse> {
        let form = join_query([
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", authorization_code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
        ]);
        self.request_json("get access token", self.token_request(form))
            .await
    }

    /// Request an app access token (client credentials grant)
    pub async fn get_app_access_token(&self) -> Result<AppTokenResponse> {
        let form = join_query([
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ]);
        self.request_json("get app access token", self.token_request(form))
            .await
    }

    /// Refresh the access token using a refresh token
    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenResponse> {
        let form = join_query([
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ]);
        self.request_json("refresh access token", self.token_request(form))
            .await
    }

    /// Get users by id and/or login. With neither filter, Helix returns the
    /// owner of the access token.
    pub async fn get_users(
        &self,
        access_token: &str,
        ids: &[&str],
        logins: &[&str],
    ) -> Result<Vec<UserData>> {
        let query = join_query(
            ids.iter()
                .map(|id| ("id", *id))
                .chain(logins.iter().map(|login| ("login", *login))),
        );
        let request = self.authorized(Method::Get, &with_query(USERS_URL, &query), access_token);
        let users: UsersResponse = self.request_json("get users", request).await?;
        Ok(users.data)
    }

    /// List EventSub subscriptions
    pub async fn get_eventsubs(
        &self,
        access_token: &str,
        filter: &EventSubFilter,
        after: Option<&str>,
    ) -> Result<SubscriptionList> {
        let query = join_query(
            filter
                .query_pair()
                .into_iter()
                .chain(after.map(|cursor| ("after", cursor))),
        );
        let request = self.authorized(
            Method::Get,
            &with_query(EVENTSUB_API_URL, &query),
            access_token,
        );
        self.request_json("get eventsubs", request).await
    }

    pub async fn delete_eventsub(&self, access_token: &str, id: &str) -> Result<()> {
        let url = with_query(EVENTSUB_API_URL, &join_query([("id", id)]));
        let request = self.authorized(Method::Delete, &url, access_token);
        self.request("delete eventsub", request).await?;
        Ok(())
    }

    /// Create a new EventSub subscription
    pub async fn create_eventsub(
        &self,
        access_token: &str,
        subscription: &CreateSubscriptionRequest,
    ) -> Result<SubscriptionData> {
        let request = self
            .authorized(Method::Post, EVENTSUB_API_URL, access_token)
            .header("Content-Type", "application/json")
            .body(serde_json::to_string(subscription)?);

        let list: SubscriptionList = self.request_json("create eventsub", request).await?;
        list.data.into_iter().next().ok_or_else(|| {
            TwitchError::MalformedPayload("create eventsub returned no subscription".to_string())
        })
    }

    /// Send a chat message, optionally as a reply
    pub async fn send_chat_message(
        &self,
        access_token: &str,
        message: &SendChatMessageRequest,
    ) -> Result<SendMessageData> {
        let request = self
            .authorized(Method::Post, CHAT_MESSAGES_URL, access_token)
            .header("Content-Type", "application/json")
            .body(serde_json::to_string(message)?);

        let response: SendMessageResponse =
            self.request_json("send chat message", request).await?;
        response.data.into_iter().next().ok_or_else(|| {
            TwitchError::MalformedPayload("send chat message returned no data".to_string())
        })
    }

    fn token_request(&self, form: String) -> HttpRequest {
        HttpRequest::new(Method::Post, TOKEN_URL)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(form)
    }

    fn authorized(&self, method: Method, url: &str, access_token: &str) -> HttpRequest {
        HttpRequest::new(method, url)
            .header("Authorization", format!("Bearer {}", access_token))
            .header("Client-Id", self.client_id.as_str())
    }

    async fn request(&self, operation: &str, request: HttpRequest) -> Result<HttpResponse> {
        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Could not {}: {}", operation, e);
                return Err(e);
            }
        };

        if response.is_success() {
            return Ok(response);
        }

        let err = match response.status {
            401 | 403 => TwitchError::Unauthorized {
                status: response.status,
                body: response.body,
            },
            status => TwitchError::HttpStatus {
                status,
                body: response.body,
            },
        };
        log::warn!("Could not {}: {}", operation, err);
        Err(err)
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: HttpRequest,
    ) -> Result<T> {
        let response = self.request(operation, request).await?;
        serde_json::from_str(&response.body).map_err(|e| {
            log::warn!("Could not decode {} response: {}", operation, e);
            TwitchError::MalformedPayload(format!("{}: {}", operation, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::twitch::transport::fake::FakeTransport;

    const USER_JSON: &str = r#"{"data":[{"id":"141981764","login":"twitchdev","display_name":"TwitchDev","type":"","broadcaster_type":"partner","description":"Supporting third-party developers","profile_image_url":"https://example.com/p.png","view_count":5980557,"created_at":"2016-12-14T20:32:28Z"}]}"#;

    fn client(transport: &Arc<FakeTransport>) -> HelixClient {
        HelixClient::new(transport.clone(), "cid", "secret")
    }

    #[test]
    fn test_join_query_preserves_order_and_encodes() {
        assert_eq!(
            join_query([("login", "b"), ("login", "a"), ("id", "x y")]),
            "login=b&login=a&id=x%20y"
        );
        assert_eq!(join_query(Vec::<(&str, &str)>::new()), "");
    }

    #[tokio::test]
    async fn test_get_eventsubs_status_takes_precedence_over_type() {
        let transport = FakeTransport::new();
        transport.route(Method::Get, EVENTSUB_API_URL, 200, r#"{"data":[]}"#);

        let filter = EventSubFilter {
            status: Some("enabled".to_string()),
            subscription_type: Some("channel.chat.message".to_string()),
            user_id: None,
        };
        client(&transport)
            .get_eventsubs("token", &filter, None)
            .await
            .unwrap();

        let requests = transport.requests();
        assert_eq!(
            requests[0].url,
            format!("{}?status=enabled", EVENTSUB_API_URL)
        );
    }

    #[tokio::test]
    async fn test_get_eventsubs_type_then_user_id_with_cursor() {
        let transport = FakeTransport::new();
        transport.route(Method::Get, EVENTSUB_API_URL, 200, r#"{"data":[]}"#);
        let helix = client(&transport);

        let filter = EventSubFilter {
            subscription_type: Some("channel.chat.message".to_string()),
            user_id: Some("42".to_string()),
            ..Default::default()
        };
        helix.get_eventsubs("token", &filter, Some("abc")).await.unwrap();

        let filter = EventSubFilter {
            user_id: Some("42".to_string()),
            ..Default::default()
        };
        helix.get_eventsubs("token", &filter, None).await.unwrap();
        helix
            .get_eventsubs("token", &EventSubFilter::default(), None)
            .await
            .unwrap();

        let urls: Vec<String> = transport.requests().into_iter().map(|r| r.url).collect();
        assert_eq!(
            urls,
            vec![
                format!("{}?type=channel.chat.message&after=abc", EVENTSUB_API_URL),
                format!("{}?user_id=42", EVENTSUB_API_URL),
                EVENTSUB_API_URL.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_get_users_composes_ids_then_logins() {
        let transport = FakeTransport::new();
        transport.route(Method::Get, USERS_URL, 200, USER_JSON);

        let users = client(&transport)
            .get_users("token", &["2", "1"], &["twitchdev"])
            .await
            .unwrap();

        assert_eq!(users[0].login, "twitchdev");
        assert_eq!(users[0].offline_image_url, None);
        let request = &transport.requests()[0];
        assert_eq!(request.url, format!("{}?id=2&id=1&login=twitchdev", USERS_URL));
        assert_eq!(request.header_value("authorization"), Some("Bearer token"));
        assert_eq!(request.header_value("client-id"), Some("cid"));
    }

    #[tokio::test]
    async fn test_failures_are_classified() {
        let transport = FakeTransport::new();
        transport.route(Method::Get, USERS_URL, 401, "nope");
        transport.route(Method::Delete, EVENTSUB_API_URL, 500, "boom");
        transport.route(Method::Get, EVENTSUB_API_URL, 200, "not json");
        let helix = client(&transport);

        let err = helix.get_users("token", &[], &[]).await.unwrap_err();
        assert!(err.is_unauthorized());

        let err = helix.delete_eventsub("token", "sub").await.unwrap_err();
        assert_eq!(
            err,
            TwitchError::HttpStatus {
                status: 500,
                body: "boom".to_string()
            }
        );

        let err = helix
            .get_eventsubs("token", &EventSubFilter::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TwitchError::MalformedPayload(_)));

        let err = helix
            .send_chat_message(
                "token",
                &SendChatMessageRequest {
                    broadcaster_id: "1".to_string(),
                    sender_id: "2".to_string(),
                    message: "hi".to_string(),
                    reply_parent_message_id: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TwitchError::NetworkFailure(_)));
    }

    #[tokio::test]
    async fn test_send_chat_message_omits_absent_reply() {
        let transport = FakeTransport::new();
        transport.route(
            Method::Post,
            CHAT_MESSAGES_URL,
            200,
            r#"{"data":[{"message_id":"m1","is_sent":true,"drop_reason":null}]}"#,
        );
        let helix = client(&transport);

        let mut message = SendChatMessageRequest {
            broadcaster_id: "1".to_string(),
            sender_id: "2".to_string(),
            message: "hello".to_string(),
            reply_parent_message_id: None,
        };
        let sent = helix.send_chat_message("token", &message).await.unwrap();
        assert!(sent.is_sent);

        message.reply_parent_message_id = Some("parent".to_string());
        helix.send_chat_message("token", &message).await.unwrap();

        let bodies: Vec<serde_json::Value> = transport
            .requests()
            .iter()
            .map(|r| serde_json::from_str(r.body.as_deref().unwrap()).unwrap())
            .collect();
        assert!(bodies[0].get("reply_parent_message_id").is_none());
        assert_eq!(bodies[1]["reply_parent_message_id"], "parent");
    }

    #[tokio::test]
    async fn test_refresh_posts_form_to_token_endpoint() {
        let transport = FakeTransport::new();
        transport.route(
            Method::Post,
            TOKEN_URL,
            200,
            r#"{"access_token":"a2","refresh_token":"r2","expires_in":14400,"scope":["chat:read"],"token_type":"bearer"}"#,
        );

        let token = client(&transport).refresh_access_token("r 1").await.unwrap();
        assert_eq!(token.access_token, "a2");

        let request = &transport.requests()[0];
        assert_eq!(
            request.body.as_deref(),
            Some("client_id=cid&client_secret=secret&grant_type=refresh_token&refresh_token=r%201")
        );
    }

    #[tokio::test]
    async fn test_create_eventsub_serializes_typed_condition() {
        let transport = FakeTransport::new();
        transport.route(
            Method::Post,
            EVENTSUB_API_URL,
            202,
            r#"{"data":[{"id":"sub-1","type":"channel.chat.message","version":"1","status":"enabled","cost":0,"condition":{"broadcaster_user_id":"1","user_id":"2"},"created_at":"2024-01-01T00:00:00Z","transport":{"method":"websocket","session_id":"s1"}}],"total":1,"total_cost":0,"max_total_cost":10}"#,
        );

        let request = CreateSubscriptionRequest {
            subscription_type: "channel.chat.message".to_string(),
            version: "1".to_string(),
            condition: SubscriptionCondition {
                broadcaster_user_id: Some("1".to_string()),
                user_id: Some("2".to_string()),
                ..Default::default()
            },
            transport: Transport::websocket("s1"),
        };
        let created = client(&transport)
            .create_eventsub("token", &request)
            .await
            .unwrap();

        assert_eq!(created.id, "sub-1");
        assert_eq!(created.transport.session_id.as_deref(), Some("s1"));
        let body: serde_json::Value =
            serde_json::from_str(transport.requests()[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "type": "channel.chat.message",
                "version": "1",
                "condition": {"broadcaster_user_id": "1", "user_id": "2"},
                "transport": {"method": "websocket", "session_id": "s1"}
            })
        );
    }

    #[test]
    fn test_user_data_round_trip_keeps_missing_optionals() {
        let users: UsersResponse = serde_json::from_str(USER_JSON).unwrap();
        let user = users.data[0].clone();
        let json = serde_json::to_string(&user).unwrap();
        let back: UserData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, user);
        assert_eq!(back.offline_image_url, None);
        assert_eq!(back.view_count, Some(5980557));
    }
}

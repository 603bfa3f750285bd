//! Twitch Helix and EventSub WebSocket integration
//!
//! - `HelixClient` issues the REST calls (OAuth token grants, users, EventSub
//!   subscriptions, chat messages) over an injectable `HttpTransport`
//! - `TokenStore` owns the user credentials and refreshes them ahead of expiry
//! - `EventSubSession` drives one EventSub websocket session: welcome,
//!   keepalive deadline, server-initiated reconnects and notification dispatch
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stonebot::backend::twitch::{
//!     EventSubSession, SessionEvent, SessionOptions, SubscriptionPlan, SubscriptionSpec,
//!     TokenStore, TungsteniteConnector,
//! };
//! use stonebot::backend::diagnostics::MessageLog;
//! use tokio::sync::mpsc;
//!
//! async fn listen(tokens: Arc<TokenStore>, broadcaster_id: &str, bot_id: &str) {
//!     let plan = SubscriptionPlan::new(
//!         tokens,
//!         vec![SubscriptionSpec::channel_chat_message(broadcaster_id, bot_id)],
//!     );
//!     let (tx, mut rx) = mpsc::unbounded_channel();
//!     let session = EventSubSession::new(
//!         Arc::new(TungsteniteConnector),
//!         plan,
//!         SessionOptions::default(),
//!         tx,
//!         MessageLog::new(),
//!     )
//!     .spawn();
//!
//!     while let Some(event) = rx.recv().await {
//!         if let SessionEvent::Notification(event) = event {
//!             println!("{:?}", event);
//!         }
//!     }
//!     let _ = session.shutdown().await;
//! }
//! ```

pub mod api;
pub mod auth;
pub mod error;
pub mod eventsub;
pub mod messages;
pub mod transport;
pub mod websocket;

// Re-export public types
pub use api::{
    CreateSubscriptionRequest, EventSubFilter, HelixClient, SendChatMessageRequest,
    SendMessageData, SubscriptionCondition, SubscriptionData, SubscriptionList, UserData,
};
pub use auth::{authorize_url, AppTokenResponse, Credentials, TokenResponse, TokenStore};
pub use error::{Result, TwitchError};
pub use eventsub::{
    EventSubSession, EventSubSessionState, SessionEvent, SessionHandle, SessionOptions,
    SessionReport, SessionStatus, SubscriptionPlan, SubscriptionSpec,
};
pub use messages::{
    Badge, ChatClearEvent, ChatMessageEvent, ClearUserMessagesEvent, MessageDeleteEvent,
    SubscriptionInfo, TwitchEvent,
};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};
pub use websocket::{TungsteniteConnector, WsConnection, WsConnector};

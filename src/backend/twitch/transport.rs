use async_trait::async_trait;

use super::error::{Result, TwitchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

/// A fully composed HTTP request: URL with query, headers and optional body
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Status and body of a completed HTTP exchange, whatever the status code
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Raw HTTP capability the Helix layer is built on.
///
/// Implementations return `Err` only when no response was obtained at all;
/// non-2xx statuses are returned as ordinary responses.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
            Method::Delete => self.client.delete(&request.url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TwitchError::NetworkFailure(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TwitchError::NetworkFailure(e.to_string()))?;

        Ok(HttpResponse { status, body })
    }
}

/// In-memory transport double shared by the tests of every layer above HTTP
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct Route {
        method: Method,
        url_prefix: String,
        status: u16,
        body: String,
    }

    #[derive(Default)]
    pub(crate) struct FakeTransport {
        routes: Mutex<Vec<Route>>,
        requests: Mutex<Vec<HttpRequest>>,
        delay: Mutex<Option<Duration>>,
    }

    impl FakeTransport {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Routes are matched in registration order by method and URL prefix
        pub(crate) fn route(&self, method: Method, url_prefix: &str, status: u16, body: &str) {
            self.routes.lock().unwrap().push(Route {
                method,
                url_prefix: url_prefix.to_string(),
                status,
                body: body.to_string(),
            });
        }

        pub(crate) fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = Some(delay);
        }

        pub(crate) fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub(crate) fn count(&self, method: Method, url_prefix: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.method == method && r.url.starts_with(url_prefix))
                .count()
        }
    }

    #[async_trait]
    impl HttpTransport for FakeTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.requests.lock().unwrap().push(request.clone());

            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let routes = self.routes.lock().unwrap();
            routes
                .iter()
                .find(|r| r.method == request.method && request.url.starts_with(&r.url_prefix))
                .map(|r| HttpResponse {
                    status: r.status,
                    body: r.body.clone(),
                })
                .ok_or_else(|| {
                    TwitchError::NetworkFailure(format!("no route for {}", request.url))
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reqwest_transport_returns_non_success_as_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/helix/users")
            .match_header("client-id", "abc")
            .with_status(401)
            .with_body(r#"{"message":"invalid token"}"#)
            .create_async()
            .await;

        let transport = ReqwestTransport::new();
        let request = HttpRequest::new(Method::Get, format!("{}/helix/users", server.url()))
            .header("Client-Id", "abc");
        let response = transport.send(request).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.status, 401);
        assert!(!response.is_success());
        assert!(response.body.contains("invalid token"));
    }

    #[tokio::test]
    async fn test_reqwest_transport_sends_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/helix/chat/messages")
            .match_body(r#"{"message":"hi"}"#)
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let transport = ReqwestTransport::new();
        let request = HttpRequest::new(
            Method::Post,
            format!("{}/helix/chat/messages", server.url()),
        )
        .header("Content-Type", "application/json")
        .body(r#"{"message":"hi"}"#.to_string());
        let response = transport.send(request).await.unwrap();

        mock.assert_async().await;
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_failure() {
        let transport = ReqwestTransport::new();
        let request = HttpRequest::new(Method::Get, "http://127.0.0.1:1/helix/users");
        let err = transport.send(request).await.unwrap_err();
        assert!(matches!(err, TwitchError::NetworkFailure(_)));
    }
}

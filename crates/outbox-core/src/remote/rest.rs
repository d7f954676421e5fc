//! JSON-over-HTTP remote data service.

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;

use super::{RemoteError, RemoteResult, RemoteService};
use crate::util::{excerpt, is_http_url, normalize_text_option};

const ERROR_EXCERPT_CHARS: usize = 180;

/// Talks to a REST service exposing `/{target}` and `/{target}/{id}`
#[derive(Clone)]
pub struct RestRemoteService {
    base_url: Url,
    token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for RestRemoteService {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RestRemoteService")
            .field("base_url", &self.base_url.as_str())
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl RestRemoteService {
    pub fn new(base_url: impl Into<String>) -> RemoteResult<Self> {
        let base_url = normalize_endpoint(base_url.into())?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| RemoteError::terminal(error.to_string()))?;
        Ok(Self {
            base_url,
            token: None,
            client,
        })
    }

    /// Authenticate every request with a bearer token
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.token = normalize_text_option(Some(token.into()));
        self
    }

    fn url(&self, segments: &[&str]) -> RemoteResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| RemoteError::terminal(format!("cannot address {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> RemoteResult<(StatusCode, String)> {
        let mut request = self
            .client
            .request(method, url)
            .header("Accept", "application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        Ok((status, body))
    }

    async fn send_expecting_success(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> RemoteResult<String> {
        let (status, body) = self.send(method, url, body).await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(status_error(status, &body))
        }
    }
}

#[async_trait]
impl RemoteService for RestRemoteService {
    async fn insert(&self, target: &str, record: &Value) -> RemoteResult<Value> {
        let url = self.url(&[target])?;
        let body = self.send_expecting_success(Method::POST, url, Some(record)).await?;
        Ok(parse_body(&body)?.unwrap_or_else(|| record.clone()))
    }

    async fn insert_many(&self, target: &str, records: &[Value]) -> RemoteResult<Vec<Value>> {
        let url = self.url(&[target])?;
        let payload = Value::Array(records.to_vec());
        let body = self.send_expecting_success(Method::POST, url, Some(&payload)).await?;
        match parse_body(&body)? {
            Some(Value::Array(stored)) => Ok(stored),
            _ => Ok(records.to_vec()),
        }
    }

    async fn update(&self, target: &str, id: &str, changes: &Value) -> RemoteResult<Value> {
        let url = self.url(&[target, id])?;
        let body = self.send_expecting_success(Method::PATCH, url, Some(changes)).await?;
        Ok(parse_body(&body)?.unwrap_or_else(|| changes.clone()))
    }

    async fn delete(&self, target: &str, id: &str) -> RemoteResult<()> {
        let url = self.url(&[target, id])?;
        self.send_expecting_success(Method::DELETE, url, None).await?;
        Ok(())
    }

    async fn fetch(&self, target: &str, id: &str) -> RemoteResult<Option<Value>> {
        let url = self.url(&[target, id])?;
        let (status, body) = self.send(Method::GET, url, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        parse_body(&body)
    }
}

#[derive(Debug, Deserialize)]
struct RemoteErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_body(body: &str) -> RemoteResult<Option<Value>> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(body)
        .map(Some)
        .map_err(|error| RemoteError::terminal(format!("invalid response payload: {error}")))
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<RemoteErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = excerpt(body, ERROR_EXCERPT_CHARS);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let message = parse_api_error(status, body);
    match status {
        StatusCode::CONFLICT => RemoteError::conflict(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::retryable(message)
        }
        status if status.is_server_error() => RemoteError::retryable(message),
        _ => RemoteError::terminal(message),
    }
}

fn transport_error(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::timeout(error.to_string())
    } else {
        RemoteError::retryable(error.to_string())
    }
}

fn normalize_endpoint(raw: String) -> RemoteResult<Url> {
    let endpoint = normalize_text_option(Some(raw))
        .ok_or_else(|| RemoteError::terminal("endpoint must not be empty"))?;
    if !is_http_url(&endpoint) {
        return Err(RemoteError::terminal(
            "endpoint must include http:// or https://",
        ));
    }
    Url::parse(endpoint.trim_end_matches('/'))
        .map_err(|error| RemoteError::terminal(format!("invalid endpoint: {error}")))
}

//! HTTP action boundary.

use crate::retry::{RetrySpec, Retryable};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::error::Error as _;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for HttpMethod {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            other => Err(format!("Unsupported HTTP method '{other}'")),
        }
    }
}

impl From<HttpMethod> for String {
    fn from(method: HttpMethod) -> Self {
        method.as_str().to_string()
    }
}

/// The `test` object of an HTTP step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpAction {
    #[serde(default)]
    pub service_name: Option<String>,
    /// Overrides the configured base URL of `service_name`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub request: RequestSpec,
    #[serde(default)]
    pub retry: Option<RetrySpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpec {
    #[serde(default)]
    pub headers: Map<String, Value>,
    /// Query parameters.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Values for `{name}` segments of the path.
    #[serde(default)]
    pub path_params: Map<String, Value>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Session token sent as the `SMSESSION` cookie.
    #[serde(default)]
    pub cookie: Option<String>,
}

/// Request body with its inferred content type.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Xml(String),
    Text(String),
}

impl RequestBody {
    /// Objects and arrays are JSON, angle-bracket documents with a
    /// closing tag are XML, anything else is plain text.
    pub fn infer(body: Option<&Value>) -> Self {
        match body {
            None | Some(Value::Null) => RequestBody::Empty,
            Some(value @ (Value::Object(_) | Value::Array(_))) => RequestBody::Json(value.clone()),
            Some(Value::String(text)) => {
                let text = text.replace("\\\"", "\"");
                let trimmed = text.trim();
                if trimmed.starts_with('<') && trimmed.ends_with('>') && trimmed.contains("</") {
                    RequestBody::Xml(text)
                } else {
                    RequestBody::Text(text)
                }
            }
            Some(other) => RequestBody::Text(other.to_string()),
        }
    }

    pub fn render(&self) -> String {
        match self {
            RequestBody::Empty => String::new(),
            RequestBody::Json(value) => value.to_string(),
            RequestBody::Xml(text) | RequestBody::Text(text) => text.clone(),
        }
    }
}

/// Fully resolved request handed to a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub base_url: String,
    pub path: String,
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub path_params: Vec<(String, String)>,
    pub body: RequestBody,
    pub cookie: Option<String>,
}

impl ApiRequest {
    pub fn new(base_url: impl Into<String>, action: &HttpAction) -> Self {
        let pairs = |map: &Map<String, Value>| -> Vec<(String, String)> {
            map.iter()
                .map(|(k, v)| (k.clone(), crate::validator::text_of(v)))
                .collect()
        };
        Self {
            base_url: base_url.into(),
            path: action.path.clone(),
            method: action.method,
            headers: pairs(&action.request.headers),
            query: pairs(&action.request.params),
            path_params: pairs(&action.request.path_params),
            body: RequestBody::infer(action.request.body.as_ref()),
            cookie: action.request.cookie.clone().filter(|c| !c.is_empty()),
        }
    }

    /// Path with `{name}` segments substituted.
    pub fn expanded_path(&self) -> String {
        self.path_params
            .iter()
            .fold(self.path.clone(), |path, (name, value)| {
                path.replace(&format!("{{{name}}}"), value)
            })
    }

    /// Absolute URL of the request.
    pub fn url(&self) -> Result<Url, TransportError> {
        let path = self.expanded_path();
        if path.contains("://") {
            return Url::parse(&path)
                .map_err(|e| TransportError::Other(format!("Invalid URL '{path}': {e}")));
        }
        let mut base = Url::parse(&self.base_url).map_err(|e| {
            TransportError::Other(format!("Invalid base URL '{}': {e}", self.base_url))
        })?;
        if path.is_empty() {
            return Ok(base);
        }
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(path.trim_start_matches('/'))
            .map_err(|e| TransportError::Other(format!("Failed to join '{}' with '{path}': {e}", self.base_url)))
    }
}

/// Response of an HTTP action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl ApiResponse {
    /// Shape stored under `response<stepId>`.
    pub fn to_test_data(&self) -> Value {
        let body = serde_json::from_str::<Value>(&self.body)
            .unwrap_or_else(|_| Value::String(self.body.clone()));
        json!({
            "responseHeaders": self.headers,
            "responseBody": body,
            "statusCode": self.status,
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Target host not found: {0}")]
    UnresolvedHost(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("An unexpected error occurred: {0}")]
    Other(String),
    #[error("Request was cancelled")]
    Cancelled,
}

impl TransportError {
    /// Well-formed response standing in for a failed call so that
    /// assertions always see the same shape.
    pub fn into_response(self) -> ApiResponse {
        let status = match self {
            TransportError::Timeout(_) => 408,
            TransportError::UnresolvedHost(_) => 404,
            _ => 500,
        };
        ApiResponse {
            status,
            headers: BTreeMap::new(),
            body: json!({ "error": self.to_string() }).to_string(),
        }
    }
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout(_) | TransportError::Io(_))
    }

    fn cancelled() -> Self {
        TransportError::Cancelled
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// [`HttpTransport`] over reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    attempt_timeout: Option<Duration>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            attempt_timeout: None,
        }
    }

    /// Deadline of a single attempt.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    fn convert_method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
            HttpMethod::Patch => Method::PATCH,
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    let message = err.to_string();
    if err.is_timeout() {
        return TransportError::Timeout(message);
    }
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string().to_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return TransportError::UnresolvedHost(message);
        }
        source = cause.source();
    }
    if err.is_connect() || err.is_request() || err.is_body() {
        TransportError::Io(message)
    } else {
        TransportError::Other(message)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = request.url()?;
        debug!("Sending request to {}", url);

        let mut builder = self
            .client
            .request(Self::convert_method(request.method), url)
            .query(&request.query);
        if let Some(timeout) = self.attempt_timeout {
            builder = builder.timeout(timeout);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(cookie) = &request.cookie {
            builder = builder.header(reqwest::header::COOKIE, format!("SMSESSION={cookie}"));
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Xml(text) => builder
                .header(reqwest::header::CONTENT_TYPE, "application/xml")
                .body(text.clone()),
            RequestBody::Text(text) => builder
                .header(reqwest::header::CONTENT_TYPE, "text/plain")
                .body(text.clone()),
        };

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response.text().await.map_err(classify)?;
        debug!(status, "Received response");

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(base: &str, path: &str) -> ApiRequest {
        let action = HttpAction {
            path: path.to_string(),
            ..HttpAction::default()
        };
        ApiRequest::new(base, &action)
    }

    #[test]
    fn test_body_inference() {
        assert_eq!(RequestBody::infer(None), RequestBody::Empty);
        assert_eq!(
            RequestBody::infer(Some(&serde_json::json!({"a": 1}))),
            RequestBody::Json(serde_json::json!({"a": 1}))
        );
        assert_eq!(
            RequestBody::infer(Some(&Value::from("<a id=\\\"1\\\">x</a>"))),
            RequestBody::Xml("<a id=\"1\">x</a>".to_string())
        );
        assert_eq!(
            RequestBody::infer(Some(&Value::from("<not xml>"))),
            RequestBody::Text("<not xml>".to_string())
        );
        assert_eq!(RequestBody::infer(Some(&Value::from(12))), RequestBody::Text("12".to_string()));
    }

    #[test]
    fn test_url_joining_and_path_params() {
        let mut req = request("http://host:8080/api", "/orders/{id}/items");
        req.path_params = vec![("id".to_string(), "42".to_string())];
        assert_eq!(req.url().unwrap().as_str(), "http://host:8080/api/orders/42/items");

        let req = request("http://host/", "status");
        assert_eq!(req.url().unwrap().as_str(), "http://host/status");

        let req = request("http://ignored", "https://other/x");
        assert_eq!(req.url().unwrap().as_str(), "https://other/x");

        assert!(matches!(request("not a url", "/x").url(), Err(TransportError::Other(_))));
    }

    #[test]
    fn test_method_parse_is_case_insensitive() {
        let method: HttpMethod = serde_json::from_value(Value::from("post")).unwrap();
        assert_eq!(method, HttpMethod::Post);
        assert!(serde_json::from_value::<HttpMethod>(Value::from("TRACE")).is_err());
    }

    #[test]
    fn test_synthetic_responses() {
        let timeout = TransportError::Timeout("slow".into()).into_response();
        assert_eq!(timeout.status, 408);
        assert!(timeout.body.contains("Request timed out"));
        assert_eq!(TransportError::UnresolvedHost("x".into()).into_response().status, 404);
        let other = TransportError::Other("boom".into()).into_response();
        assert_eq!(other.status, 500);
        assert!(other.body.contains("An unexpected error occurred: boom"));
    }

    #[test]
    fn test_response_test_data_parses_json_body() {
        let response = ApiResponse {
            status: 200,
            headers: BTreeMap::from([("x-id".to_string(), "1".to_string())]),
            body: r#"{"ok":true}"#.to_string(),
        };
        assert_eq!(
            response.to_test_data(),
            serde_json::json!({
                "responseHeaders": {"x-id": "1"},
                "responseBody": {"ok": true},
                "statusCode": 200
            })
        );
    }
}

//! HTTP transport seam for the page loop.

use async_trait::async_trait;
use serde_json::Value;

use crate::auth::PreparedAuth;
use crate::error::RestError;

/// One outbound API request.
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: String,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub basic_auth: Option<(String, String)>,
    pub body: Option<Value>,
}

/// Status and decoded body of a response.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub body: Value,
    pub text: String,
}

/// Issues API requests. The engine only sees this trait, so page-loop
/// behavior can be exercised without a live endpoint.
#[async_trait]
pub trait RestTransport: Send + Sync {
    async fn execute(&self, request: RestRequest) -> Result<RestResponse, RestError>;
}

/// Per-request timeout for API calls.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// The reqwest-backed transport used in production.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RestTransport for HttpTransport {
    async fn execute(&self, request: RestRequest) -> Result<RestResponse, RestError> {
        let mut builder = match request.method.as_str() {
            "POST" => self.client.post(&request.url),
            "PUT" => self.client.put(&request.url),
            "PATCH" => self.client.patch(&request.url),
            "DELETE" => self.client.delete(&request.url),
            _ => self.client.get(&request.url),
        };
        builder = builder.query(&request.query);
        builder = builder.header("Content-Type", "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some((user, password)) = &request.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let body = serde_json::from_str(&text).unwrap_or(Value::Null);
        Ok(RestResponse { status, body, text })
    }
}

impl RestRequest {
    /// Build a request from prepared auth plus per-call pieces.
    pub fn new(
        method: &str,
        url: String,
        query: Vec<(String, String)>,
        headers: Vec<(String, String)>,
        auth: &PreparedAuth,
        body: Option<Value>,
    ) -> Self {
        let mut all_query = query;
        all_query.extend(auth.params.iter().cloned());
        let mut all_headers = headers;
        all_headers.extend(auth.headers.iter().cloned());
        Self {
            method: method.to_string(),
            url,
            query: all_query,
            headers: all_headers,
            basic_auth: auth.basic.clone(),
            body,
        }
    }
}

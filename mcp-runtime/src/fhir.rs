use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder};
use serde_json::Value;
use thiserror::Error;

use crate::util::client;

const FHIR_JSON: &str = "application/fhir+json";

static RESOURCE_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Za-z]+$").expect("valid resource type regex"));
static LOGICAL_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-.]{1,64}$").expect("valid logical id regex"));

/// CRUD operations the tool surface can forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Search,
    Read,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Search => "search",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Failed to reach FHIR server at {url}: {message}")]
    Connection { url: String, message: String },

    /// Non-2xx answer; `body` is usually an `OperationOutcome`.
    #[error("FHIR server answered with HTTP {status}")]
    Status { status: u16, body: Value },

    #[error("Failed to read FHIR server response: {0}")]
    Decode(String),

    /// Rejected before any request was sent.
    #[error("Invalid FHIR request: {0}")]
    InvalidRequest(String),
}

impl RemoteError {
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Executes resolved requests against a FHIR server.
///
/// `payload` is the resource for create/update, the search criteria object for
/// search, and `{ "id": .. }` for read/delete.
pub trait ResourceExecutor: Send + Sync {
    fn execute(
        &self,
        operation: Operation,
        resource_type: &str,
        payload: &Value,
    ) -> impl Future<Output = Result<Value, RemoteError>> + Send;

    /// The server's CapabilityStatement.
    fn metadata(&self) -> impl Future<Output = Result<Value, RemoteError>> + Send;
}

#[derive(Debug, Clone)]
pub struct FhirClient {
    base_url: String,
    access_token: Option<String>,
    http: reqwest::Client,
}

impl FhirClient {
    pub fn new(
        base_url: impl Into<String>,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let http = client(timeout)
            .map_err(|e| RemoteError::InvalidRequest(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Segments are appended below the base path and can never climb above it.
    fn url(&self, segments: &[&str]) -> Result<reqwest::Url, RemoteError> {
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|e| {
            RemoteError::InvalidRequest(format!("invalid FHIR URL '{}': {e}", self.base_url))
        })?;
        url.path_segments_mut()
            .map_err(|()| {
                RemoteError::InvalidRequest(format!(
                    "FHIR base URL '{}' cannot carry a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: reqwest::Url) -> RequestBuilder {
        let request = self.http.request(method, url).header(ACCEPT, FHIR_JSON);
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn with_body(request: RequestBuilder, body: &Value) -> Result<RequestBuilder, RemoteError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| RemoteError::InvalidRequest(format!("cannot encode resource: {e}")))?;
        Ok(request.header(CONTENT_TYPE, FHIR_JSON).body(bytes))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, RemoteError> {
        let response = request.send().await.map_err(|e| RemoteError::Connection {
            url: self.base_url.clone(),
            message: e.to_string(),
        })?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        let body = parse_response_body(&bytes);
        if (200..=299).contains(&status) {
            Ok(body)
        } else {
            Err(RemoteError::Status { status, body })
        }
    }
}

impl ResourceExecutor for FhirClient {
    async fn execute(
        &self,
        operation: Operation,
        resource_type: &str,
        payload: &Value,
    ) -> Result<Value, RemoteError> {
        validate_resource_type(resource_type)?;
        let request = match operation {
            Operation::Create => Self::with_body(
                self.request(Method::POST, self.url(&[resource_type])?),
                payload,
            )?,
            Operation::Search => self
                .request(Method::GET, self.url(&[resource_type])?)
                .query(&search_query(payload)),
            Operation::Read => {
                let id = payload_id(payload)?;
                self.request(Method::GET, self.url(&[resource_type, id])?)
            }
            Operation::Update => {
                let id = payload_id(payload)?;
                Self::with_body(
                    self.request(Method::PUT, self.url(&[resource_type, id])?),
                    payload,
                )?
            }
            Operation::Delete => {
                let id = payload_id(payload)?;
                self.request(Method::DELETE, self.url(&[resource_type, id])?)
            }
        };
        self.send(request).await
    }

    async fn metadata(&self) -> Result<Value, RemoteError> {
        let request = self.request(Method::GET, self.url(&["metadata"])?);
        self.send(request).await
    }
}

pub fn validate_resource_type(resource_type: &str) -> Result<(), RemoteError> {
    if RESOURCE_TYPE.is_match(resource_type) {
        Ok(())
    } else {
        Err(RemoteError::InvalidRequest(format!(
            "'{resource_type}' is not a valid FHIR resource type"
        )))
    }
}

pub fn validate_logical_id(id: &str) -> Result<(), RemoteError> {
    if LOGICAL_ID.is_match(id) && !id.chars().all(|c| c == '.') {
        Ok(())
    } else {
        Err(RemoteError::InvalidRequest(format!(
            "'{id}' is not a valid FHIR logical id"
        )))
    }
}

fn payload_id(payload: &Value) -> Result<&str, RemoteError> {
    let id = payload
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::InvalidRequest("a logical id is required".to_string()))?;
    validate_logical_id(id)?;
    Ok(id)
}

/// Flatten search criteria into query pairs. Arrays repeat the parameter;
/// nulls are skipped.
pub fn search_query(criteria: &Value) -> Vec<(String, String)> {
    let Some(map) = criteria.as_object() else {
        return Vec::new();
    };
    let mut pairs = Vec::new();
    for (key, value) in map {
        match value {
            Value::Array(items) => {
                pairs.extend(
                    items
                        .iter()
                        .filter_map(query_value)
                        .map(|v| (key.clone(), v)),
                );
            }
            other => {
                if let Some(v) = query_value(other) {
                    pairs.push((key.clone(), v));
                }
            }
        }
    }
    pairs
}

fn query_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Resources from a searchset `Bundle`, in entry order.
pub fn bundle_resources(bundle: &Value) -> Vec<Value> {
    bundle
        .get("entry")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("resource").cloned())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_response_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).to_string()))
}

//! Request and response types for the HTTP relay.
//!
//! Options arrive from script code as loosely typed JSON; unknown or
//! mistyped fields are ignored rather than rejected.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use thiserror::Error;

use crate::timer::delay_from_ms;

/// Status slot of the wire array when the URL could not be parsed.
pub const INVALID_URL_CODE: i64 = -1;
/// Status slot of the wire array when no method was given.
pub const MISSING_METHOD_CODE: i64 = -2;
pub const INVALID_URL_MESSAGE: &str = "missing/incorrect url";
/// Error name the connector's HTTP layer recognises for transport failures.
pub const NETWORK_ERROR_NAME: &str = "SwiftError";

/// How the caller wants the response body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseType {
    #[default]
    Text,
    ArrayBuffer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Text(String),
    Bytes(Bytes),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    /// `None` means the relay default
    pub timeout: Option<Duration>,
    pub response_type: ResponseType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub method: Option<String>,
    pub options: RequestOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Text(String),
    Binary(Bytes),
    /// Text response that was not valid UTF-8
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// URL after redirects
    pub url: String,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("{}", INVALID_URL_MESSAGE)]
    InvalidUrl,

    #[error("missing method for {url}")]
    MissingMethod { url: String },

    #[error("{message}")]
    Network { message: String },
}

pub type HttpOutcome = Result<HttpResponse, HttpError>;

/// Header values are sent as their string form; `null` values are skipped.
fn header_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// A byte array from script code: every element an integer in 0..=255.
fn byte_array(values: &[Value]) -> Option<Bytes> {
    values
        .iter()
        .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect::<Option<Vec<u8>>>()
        .map(Bytes::from)
}

impl RequestOptions {
    pub fn from_value(options: &Value) -> Self {
        let headers = options
            .get("headers")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| header_value(v).map(|v| (k.clone(), v)))
                    .collect()
            })
            .unwrap_or_default();

        let body = match options.get("body") {
            Some(Value::String(s)) => Some(RequestBody::Text(s.clone())),
            Some(Value::Array(values)) => byte_array(values).map(RequestBody::Bytes),
            _ => None,
        };

        let timeout = options
            .get("timeout")
            .and_then(Value::as_f64)
            .filter(|ms| *ms > 0.0)
            .map(delay_from_ms);

        let response_type = match options.get("responseType").and_then(Value::as_str) {
            Some("arraybuffer") => ResponseType::ArrayBuffer,
            _ => ResponseType::Text,
        };

        Self {
            headers,
            body,
            timeout,
            response_type,
        }
    }
}

impl HttpRequest {
    /// Build from the `(method, url, options)` triple script code passes.
    pub fn from_parts(method: Option<&str>, url: &str, options: &Value) -> Self {
        Self {
            url: url.to_string(),
            method: method.map(str::to_string),
            options: RequestOptions::from_value(options),
        }
    }
}

impl ResponseBody {
    fn to_wire(&self) -> Value {
        match self {
            ResponseBody::Text(text) => Value::String(text.clone()),
            ResponseBody::Binary(bytes) => Value::from(bytes.to_vec()),
            ResponseBody::Empty => Value::Null,
        }
    }
}

/// JSON form of an outcome, as the connector's HTTP layer expects it:
/// `[status, body, headers, finalUrl]`, `[-1, message, null]`,
/// `[-2, url, null]` or `["error", {message, name}]`.
pub fn outcome_to_wire(outcome: &HttpOutcome) -> Value {
    match outcome {
        Ok(response) => json!([
            response.status,
            response.body.to_wire(),
            response.headers,
            response.url
        ]),
        Err(HttpError::InvalidUrl) => json!([INVALID_URL_CODE, INVALID_URL_MESSAGE, null]),
        Err(HttpError::MissingMethod { url }) => json!([MISSING_METHOD_CODE, url, null]),
        Err(HttpError::Network { message }) => json!([
            "error",
            { "message": message, "name": NETWORK_ERROR_NAME }
        ]),
    }
}

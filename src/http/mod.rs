//! HTTP relay for script code.
//!
//! The runtime cannot do its own networking; it asks the bridge to perform a
//! request and gets a single result back. Validation happens before anything
//! touches the network: an unparsable URL and a missing method are reported
//! as distinct structured errors, transport failures as a third. Requests are
//! not cancellable; their timeout is the only bound on their lifetime.

mod types;

pub use types::{
    outcome_to_wire, HttpError, HttpOutcome, HttpRequest, HttpResponse, RequestBody,
    RequestOptions, ResponseBody, ResponseType, INVALID_URL_CODE, MISSING_METHOD_CODE,
};

use std::collections::BTreeMap;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::Method;
use tracing::debug;
use url::Url;

use crate::config::HttpConfig;
use crate::error::{BridgeError, BridgeResult};

/// Characters escaped when re-encoding a URL that failed to parse. Everything
/// allowed in a query stays as is.
const QUERY_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Performs requests on behalf of the script runtime.
pub struct HttpRelay {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl HttpRelay {
    pub fn new(config: &HttpConfig) -> BridgeResult<Self> {
        let mut builder = reqwest::Client::builder().user_agent(config.user_agent.as_str());
        if !config.system_proxy {
            builder = builder.no_proxy();
        }

        let client = builder
            .build()
            .map_err(|e| BridgeError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            default_timeout: config.timeout(),
        })
    }

    /// Parse a URL as given, or after decoding and re-encoding it.
    pub fn resolve_url(raw: &str) -> Result<Url, HttpError> {
        if let Ok(url) = Url::parse(raw) {
            return Ok(url);
        }

        let decoded = urlencoding::decode(raw).map_err(|_| HttpError::InvalidUrl)?;
        let encoded = utf8_percent_encode(&decoded, QUERY_ESCAPE).to_string();
        Url::parse(&encoded).map_err(|_| HttpError::InvalidUrl)
    }

    /// Run one request to completion.
    pub async fn execute(&self, request: HttpRequest) -> HttpOutcome {
        let url = Self::resolve_url(&request.url)?;

        let method = request.method.as_deref().ok_or_else(|| HttpError::MissingMethod {
            url: request.url.clone(),
        })?;
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(|_| {
            HttpError::Network {
                message: format!("invalid HTTP method '{}'", method),
            }
        })?;

        let options = request.options;
        debug!(target: "http", "{} {}", method, url);

        let mut builder = self
            .client
            .request(method, url)
            .timeout(options.timeout.unwrap_or(self.default_timeout));

        for (name, value) in &options.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match options.body {
            Some(RequestBody::Text(text)) => builder.body(text),
            Some(RequestBody::Bytes(bytes)) => builder.body(bytes),
            None => builder,
        };

        let response = builder.send().await.map_err(|e| HttpError::Network {
            message: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();

        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes());
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert_with(|| value.into_owned());
        }

        let bytes = response.bytes().await.map_err(|e| HttpError::Network {
            message: e.to_string(),
        })?;

        let body = match options.response_type {
            ResponseType::ArrayBuffer => ResponseBody::Binary(bytes),
            ResponseType::Text => match std::str::from_utf8(&bytes) {
                Ok(text) => ResponseBody::Text(text.to_string()),
                Err(_) => ResponseBody::Empty,
            },
        };

        debug!(target: "http", "{} {} -> {}", status, final_url, bytes_len(&body));

        Ok(HttpResponse {
            status,
            headers,
            url: final_url,
            body,
        })
    }
}

fn bytes_len(body: &ResponseBody) -> usize {
    match body {
        ResponseBody::Text(text) => text.len(),
        ResponseBody::Binary(bytes) => bytes.len(),
        ResponseBody::Empty => 0,
    }
}

//! Service stub over a configured HTTP client.
//!
//! A [`ServiceStub`] binds a `reqwest::Client` (server TLS or mutual TLS) to
//! a base URL and the static `X-Authorization` header. Sending goes through an
//! optional transport retry for transient failures; this is independent of
//! device token polling.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::DeviceBindingError;

/// Header carrying the static client authorization.
pub const AUTHORIZATION_HEADER: &str = "X-Authorization";

/// Error body shared by all GMS and FD endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Service error code.
    pub error_code: String,
    /// Human readable description.
    #[serde(default)]
    pub description: String,
}

/// HTTP client bound to one service.
#[derive(Debug, Clone)]
pub struct ServiceStub {
    client: Client,
    base_url: String,
    authorization: String,
    retry: RetryPolicy,
}

impl ServiceStub {
    /// Bind `client` to `base_url`.
    pub fn new(client: Client, base_url: &str, authorization: &str, retry: RetryPolicy) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            authorization: authorization.to_string(),
            retry,
        }
    }

    /// Base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for `path`.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Request builder with the authorization header applied.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header(AUTHORIZATION_HEADER, &self.authorization)
    }

    /// GET request builder.
    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    /// POST request builder.
    pub fn post(&self, path: &str) -> RequestBuilder {
        self.request(Method::POST, path)
    }

    /// DELETE request builder.
    pub fn delete(&self, path: &str) -> RequestBuilder {
        self.request(Method::DELETE, path)
    }

    /// Send a request built by this stub.
    ///
    /// Any HTTP response is returned as `Ok`, including error statuses; only
    /// failures that never produced a response become
    /// [`DeviceBindingError::TransportError`]. With retries enabled, 429,
    /// 5xx, connect errors and timeouts are retried with exponential backoff
    /// and the last response wins.
    pub async fn send(&self, request_builder: RequestBuilder) -> Result<Response, DeviceBindingError> {
        let outcome = if !self.retry.is_enabled() || request_builder.try_clone().is_none() {
            execute_request_builder(request_builder).await
        } else {
            let backoff = ExponentialBuilder::default()
                .with_min_delay(self.retry.min_delay)
                .with_max_delay(self.retry.max_delay)
                .with_max_times(self.retry.max_retries);

            (|| async {
                let request_builder = request_builder.try_clone().ok_or_else(|| {
                    RequestHandleError::permanent(
                        "<unknown>".to_string(),
                        "request cannot be retried because it is not cloneable".to_string(),
                    )
                })?;
                execute_request_builder(request_builder).await
            })
            .retry(backoff)
            .when(RequestHandleError::is_retryable)
            .notify(|err: &RequestHandleError, dur: Duration| {
                debug!(url = %err.url, error = %err.error, delay_ms = dur.as_millis() as u64, "Retrying request");
            })
            .await
        };

        match outcome {
            Ok(response) => Ok(response),
            Err(RequestHandleError {
                response: Some(response),
                ..
            }) => Ok(response),
            Err(err) => {
                warn!(url = %err.url, error = %err.error, "Request failed");
                Err(DeviceBindingError::transport(format!(
                    "Request to {} failed: {}",
                    err.url, err.error
                )))
            },
        }
    }
}

#[derive(Debug)]
struct RequestHandleError {
    url: String,
    error: String,
    retryable: bool,
    /// Retryable status responses are kept so the caller can map the body
    /// once retries are exhausted.
    response: Option<Response>,
}

impl RequestHandleError {
    fn retryable(url: String, error: String, response: Option<Response>) -> Self {
        Self {
            url,
            error,
            retryable: true,
            response,
        }
    }

    fn permanent(url: String, error: String) -> Self {
        Self {
            url,
            error,
            retryable: false,
            response: None,
        }
    }

    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

async fn execute_request_builder(request_builder: RequestBuilder) -> Result<Response, RequestHandleError> {
    let (client, request) = request_builder.build_split();
    let request = request.map_err(|err| {
        RequestHandleError::permanent(
            err.url()
                .map(|url| url.to_string())
                .unwrap_or_else(|| "<unknown>".to_string()),
            format!("request build failed: {err}"),
        )
    })?;
    let url = request.url().to_string();

    match client.execute(request).await {
        Ok(resp) => {
            let status = resp.status();
            debug!(url = %url, status = %status, "Response received");
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                return Err(RequestHandleError::retryable(
                    url,
                    format!("request error with bad status code {status}"),
                    Some(resp),
                ));
            }
            Ok(resp)
        },
        Err(err) => {
            if err.is_timeout() || err.is_connect() {
                return Err(RequestHandleError::retryable(
                    url,
                    format!("request timeout/connect error: {err}"),
                    None,
                ));
            }
            Err(RequestHandleError::permanent(url, format!("request failed: {err}")))
        },
    }
}

/// Map an error response to [`DeviceBindingError::RemoteServiceError`].
///
/// Bodies without the `{errorCode, description}` shape fall back to the HTTP
/// status code and its canonical reason.
pub async fn remote_error(response: Response) -> DeviceBindingError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let err = remote_error_from_parts(status, &body);
    warn!(status = %status, error = %err, "Service returned an error");
    err
}

/// Body mapping behind [`remote_error`].
pub fn remote_error_from_parts(status: StatusCode, body: &str) -> DeviceBindingError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) if !parsed.error_code.is_empty() => {
            DeviceBindingError::remote(parsed.error_code, parsed.description)
        },
        _ => DeviceBindingError::remote(
            status.as_u16().to_string(),
            status.canonical_reason().unwrap_or("Unknown status"),
        ),
    }
}

/// Read the body as text or fail with `MalformedResponse`.
pub async fn read_text(response: Response) -> Result<String, DeviceBindingError> {
    response
        .text()
        .await
        .map_err(|e| DeviceBindingError::malformed(format!("unreadable body: {e}")))
}

/// Decode a JSON body or fail with `MalformedResponse`.
pub async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, DeviceBindingError> {
    let body = read_text(response).await?;
    serde_json::from_str(&body).map_err(|e| DeviceBindingError::malformed(format!("unexpected body: {e}")))
}

//! Common utilities for the ARM client
//!
//! Request plumbing shared by every resource type: URL building with
//! `api-version`, bearer authentication, error envelope decoding, `nextLink`
//! pagination and long-running operation polling.

use crate::error::AzureError;
use crate::models::{ErrorResponse, ListResult};
use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Maximum number of status polls for one long-running operation
const MAX_OPERATION_POLLS: u32 = 120;

/// Default wait between polls when ARM does not send `Retry-After`
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct OperationStatus {
    status: String,
    #[serde(default)]
    error: Option<crate::models::ErrorDetail>,
}

/// HTTP client wrapper with authentication
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpClient {
    /// Create a new HTTP client wrapper
    pub fn new(client: Client, base_url: String, token: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a full URL from a resource path and API version
    pub fn build_url(&self, path: &str, api_version: &str) -> String {
        if path.starts_with("http") {
            return path.to_string();
        }
        format!("{}{}?api-version={}", self.base_url, path, api_version)
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// Turn a non-success response into an [`AzureError`]
    async fn error_from_response(response: Response) -> AzureError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return AzureError::NotFound(body);
        }
        let detail = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or_default();
        let message = if detail.message.is_empty() { body } else { detail.message };
        AzureError::api(status.as_u16(), detail.code, message)
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str, api_version: &str) -> Result<T, AzureError> {
        let url = self.build_url(path, api_version);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Fetch every page of a list response
    pub async fn list<T: DeserializeOwned>(&self, path: &str, api_version: &str) -> Result<Vec<T>, AzureError> {
        let mut url = self.build_url(path, api_version);
        let mut all_results = Vec::new();

        loop {
            debug!("Fetching page: {}", url);
            let page: ListResult<T> = self.get(&url, api_version).await?;
            all_results.extend(page.value);

            match page.next_link {
                Some(next) if !next.is_empty() => url = next,
                _ => break,
            }
        }

        Ok(all_results)
    }

    /// Make a PUT request, optionally guarded by `If-Match`, and wait for the
    /// operation to finish.
    pub async fn put<B, T>(&self, path: &str, api_version: &str, body: &B, etag: Option<&str>) -> Result<T, AzureError>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.build_url(path, api_version);
        debug!("PUT {}", url);

        let mut request = self
            .client
            .put(&url)
            .header("Authorization", self.auth_header())
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(etag) = etag.filter(|e| !e.is_empty()) {
            request = request.header("If-Match", etag);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let headers = response.headers().clone();
        let text = response.text().await?;
        self.wait_for_operation(&headers).await?;

        if text.trim().is_empty() {
            // Some PUTs answer 202 with no body; read the final state back
            return self.get(path, api_version).await;
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Make a DELETE request and wait for it to finish. A missing resource is
    /// treated as already deleted.
    pub async fn delete(&self, path: &str, api_version: &str) -> Result<(), AzureError> {
        let url = self.build_url(path, api_version);
        debug!("DELETE {}", url);

        let response = self
            .client
            .delete(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("DELETE {}: already gone", url);
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let headers = response.headers().clone();
        self.wait_for_operation(&headers).await
    }

    /// Poll `Azure-AsyncOperation` (or `Location`) until the operation settles
    async fn wait_for_operation(&self, headers: &HeaderMap) -> Result<(), AzureError> {
        let operation_url = headers
            .get("Azure-AsyncOperation")
            .or_else(|| headers.get("Location"))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let Some(operation_url) = operation_url else {
            return Ok(());
        };

        let mut interval = retry_after(headers).unwrap_or(DEFAULT_POLL_INTERVAL);
        for _ in 0..MAX_OPERATION_POLLS {
            tokio::time::sleep(interval).await;

            let response = self
                .client
                .get(&operation_url)
                .header("Authorization", self.auth_header())
                .send()
                .await?;
            if response.status() == StatusCode::ACCEPTED {
                interval = retry_after(response.headers()).unwrap_or(DEFAULT_POLL_INTERVAL);
                continue;
            }
            if !response.status().is_success() {
                return Err(Self::error_from_response(response).await);
            }

            let text = response.text().await?;
            // Location polling returns the resource itself once done
            let Ok(status) = serde_json::from_str::<OperationStatus>(&text) else {
                return Ok(());
            };
            match status.status.as_str() {
                "Succeeded" => return Ok(()),
                "Failed" | "Canceled" => {
                    let detail = status.error.unwrap_or_default();
                    return Err(AzureError::api(200, detail.code, detail.message));
                }
                other => debug!("Operation {} still {}", operation_url, other),
            }
        }

        Err(AzureError::api(
            504,
            "OperationTimedOut",
            format!("operation {} did not finish", operation_url),
        ))
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

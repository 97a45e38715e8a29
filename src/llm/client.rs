//! Shared HTTP plumbing for provider calls.
//!
//! Every request races the generation's cancellation token, and every
//! non-2xx status is turned into a typed error through the provider's code
//! table before the caller sees the response.

use std::time::Duration;

use reqwest::{RequestBuilder, Response};
use tokio_util::sync::CancellationToken;

use super::provider::{ProviderDescriptor, map_status_error};
use crate::error::{GenerationError, Result};

/// Connect timeout for provider endpoints. Streams themselves have no idle
/// timeout; they rely on the transport.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Authenticated HTTP client bound to one provider.
#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    descriptor: ProviderDescriptor,
    credential: Option<String>,
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("provider", &self.descriptor.kind)
            .field("base_url", &self.descriptor.base_url)
            .field("has_credential", &self.credential.is_some())
            .finish()
    }
}

impl ProviderClient {
    /// Create a client. An empty credential counts as missing.
    #[must_use]
    pub fn new(descriptor: ProviderDescriptor, credential: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self {
            http,
            descriptor,
            credential: credential.filter(|c| !c.trim().is_empty()),
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    fn credential(&self) -> Result<&str> {
        self.credential.as_deref().ok_or_else(|| {
            GenerationError::configuration(format!(
                "No API key configured for {} (set {})",
                self.descriptor.display_name,
                self.descriptor.kind.credential_env()
            ))
        })
    }

    /// Authenticated POST with a JSON body.
    pub fn post(&self, path: &str, body: &serde_json::Value) -> Result<RequestBuilder> {
        let headers = self.descriptor.headers(self.credential()?)?;
        Ok(self
            .http
            .post(self.descriptor.url(path))
            .headers(headers)
            .json(body))
    }

    /// Authenticated GET.
    pub fn get(&self, path: &str) -> Result<RequestBuilder> {
        let headers = self.descriptor.headers(self.credential()?)?;
        Ok(self.http.get(self.descriptor.url(path)).headers(headers))
    }

    /// Send a request, racing `cancel`, and reject non-2xx statuses.
    pub async fn send(&self, request: RequestBuilder, cancel: &CancellationToken) -> Result<Response> {
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(GenerationError::aborted()),
            response = request.send() => response?,
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(GenerationError::aborted()),
            body = response.text() => body.unwrap_or_default(),
        };
        tracing::warn!(
            provider = %self.descriptor.kind,
            status = status.as_u16(),
            body_len = body.len(),
            "Provider returned error status"
        );
        Err(map_status_error(self.descriptor.kind, status.as_u16(), &body))
    }

    /// Send and decode a JSON body of type `T`.
    pub async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let response = self.send(request, cancel).await?;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(GenerationError::aborted()),
            body = response.json::<T>() => body.map_err(GenerationError::from),
        }
    }
}

//! Authenticated request wrapper.
//!
//! This module provides `AuthenticatedClient`, which attaches the current
//! access credential to outbound requests, turns a 401 into one coordinated
//! refresh, and retries the request exactly once with the new credential.

use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{CredentialPair, CredentialStore, RefreshCoordinator, Token};
use crate::config::resolve_endpoint;
use crate::session::{Identity, SessionEvents};

use super::{ApiError, ApiRequest};

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    access: String,
    refresh: String,
}

/// Request wrapper for one session.
/// Clone is cheap - the HTTP client, store and coordinator are all shared.
#[derive(Clone)]
pub struct AuthenticatedClient {
    client: Client,
    base_url: String,
    store: CredentialStore,
    coordinator: RefreshCoordinator,
    events: SessionEvents,
}

impl AuthenticatedClient {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        store: CredentialStore,
        coordinator: RefreshCoordinator,
        events: SessionEvents,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            store,
            coordinator,
            events,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        resolve_endpoint(&self.base_url, endpoint)
    }

    /// Send `request` to `endpoint` with the current access credential.
    ///
    /// A 401 triggers one coordinated refresh and one retry. The retry's
    /// response is returned whatever its status; other statuses are returned
    /// unmodified.
    pub async fn request(&self, endpoint: &str, request: &ApiRequest) -> Result<Response, ApiError> {
        let token = self.store.access().ok_or(ApiError::NoAccessCredential)?;
        let url = self.url(endpoint);

        let response = self.send(&url, request, &token).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!(url = %url, "Access credential rejected, refreshing");
        let fresh = match self.coordinator.refresh_after_rejection(&token).await {
            Ok(fresh) => fresh,
            Err(ApiError::NoRefreshCredential) => {
                self.force_logout("access credential rejected and no refresh credential is stored");
                return Err(ApiError::NoRefreshCredential);
            }
            // Either the coordinator already ended the session, or it ended
            // while the refresh was in flight. Never retried.
            Err(e) => return Err(e),
        };

        let retried = self.send(&url, request, &fresh).await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            warn!(url = %url, "Request rejected again after refresh, not retrying");
        }
        Ok(retried)
    }

    /// `request` followed by JSON decoding of a 2xx body.
    pub async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        request: &ApiRequest,
    ) -> Result<T, ApiError> {
        let response = Self::check_response(self.request(endpoint, request).await?).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON from {}: {}", endpoint, e)))
    }

    async fn send(&self, url: &str, request: &ApiRequest, token: &Token) -> Result<Response, ApiError> {
        let builder = request.apply(self.client.request(request.method.clone(), url))?;
        let response = builder.bearer_auth(token.as_str()).send().await?;
        debug!(method = %request.method, url = url, status = response.status().as_u16(), "Request completed");
        Ok(response)
    }

    /// Clear the store and tell the host the session is gone.
    pub(crate) fn force_logout(&self, reason: &str) {
        info!(reason = reason, "Forcing logout");
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear credentials during forced logout");
        }
        self.events.expired(reason);
    }

    /// Check if response is successful, returning an error with body if not.
    pub async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Exchange a username and password for a credential pair.
    ///
    /// Returns `Ok(None)` when the server rejects the credentials.
    pub async fn obtain_pair(
        &self,
        token_endpoint: &str,
        username: &str,
        password: &str,
    ) -> Result<Option<CredentialPair>, ApiError> {
        let response = self
            .client
            .post(self.url(token_endpoint))
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        if !response.status().is_success() {
            debug!(status = response.status().as_u16(), "Login rejected");
            return Ok(None);
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse token response: {}", e)))?;

        match (Token::new(body.access), Token::new(body.refresh)) {
            (Some(access), Some(refresh)) => Ok(Some(CredentialPair::new(access, refresh))),
            _ => Err(ApiError::InvalidResponse("Token response is missing a credential".to_string())),
        }
    }

    /// Fetch the identity for a credential that is not stored yet.
    pub async fn identity_for(&self, identity_endpoint: &str, access: &Token) -> Result<Identity, ApiError> {
        let response = self
            .client
            .get(self.url(identity_endpoint))
            .bearer_auth(access.as_str())
            .send()
            .await?;
        let response = Self::check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse identity: {}", e)))
    }
}

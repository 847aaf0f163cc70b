//! Service identity tokens.
//!
//! Every core service call carries a bearer ID token. [`RenewingServiceTokens`]
//! exchanges the service secret with the auth service and keeps the latest
//! tokens (or the latest error) for readers.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Source of the bearer token attached to core service calls.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns the current ID token, or the error from the last renewal.
    fn id_token(&self) -> SyncResult<String>;

    /// Renews the tokens now.
    async fn refresh(&self) -> SyncResult<()>;

    /// Renews on an interval until cancelled.
    async fn refresh_routine(&self, cancel: CancellationToken) {
        cancel.cancelled().await;
    }
}

/// A fixed token that never renews.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Creates a static token source.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    fn id_token(&self) -> SyncResult<String> {
        Ok(self.0.clone())
    }

    async fn refresh(&self) -> SyncResult<()> {
        Ok(())
    }
}

/// Tokens returned by the auth service's secret exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceTokens {
    /// Access token.
    pub access_token: String,
    /// Refresh token.
    pub refresh_token: String,
    /// ID token sent as the bearer credential.
    pub id_token: String,
}

#[derive(Debug)]
enum TokenState {
    Empty,
    Ready(ServiceTokens),
    Failed(String),
}

/// Service tokens renewed on an interval.
#[derive(Debug)]
pub struct RenewingServiceTokens {
    http: reqwest::Client,
    auth_endpoint: String,
    secret: String,
    interval: Duration,
    state: RwLock<TokenState>,
}

impl RenewingServiceTokens {
    /// Creates a token source. Call [`TokenSource::refresh`] before first use.
    pub fn new(
        auth_endpoint: impl Into<String>,
        secret: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth_endpoint: auth_endpoint.into(),
            secret: secret.into(),
            interval,
            state: RwLock::new(TokenState::Empty),
        }
    }

    async fn exchange(&self) -> SyncResult<ServiceTokens> {
        if self.secret.is_empty() {
            return Err(SyncError::Auth("service auth secret not defined".into()));
        }

        let url = format!("{}/sat/exchange/jwt", self.auth_endpoint);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.secret)
            .send()
            .await?;

        if response.status().as_u16() != 201 {
            return Err(SyncError::Status {
                url,
                status: response.status().as_u16(),
            });
        }

        Ok(response.json::<ServiceTokens>().await?)
    }
}

#[async_trait]
impl TokenSource for RenewingServiceTokens {
    fn id_token(&self) -> SyncResult<String> {
        match &*self.state.read() {
            TokenState::Ready(tokens) => Ok(tokens.id_token.clone()),
            TokenState::Failed(message) => Err(SyncError::Auth(message.clone())),
            TokenState::Empty => Err(SyncError::Auth("service tokens not loaded".into())),
        }
    }

    async fn refresh(&self) -> SyncResult<()> {
        let result = self.exchange().await;
        let mut state = self.state.write();
        match result {
            Ok(tokens) => {
                *state = TokenState::Ready(tokens);
                Ok(())
            }
            Err(e) => {
                *state = TokenState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn refresh_routine(&self, cancel: CancellationToken) {
        info!(interval = ?self.interval, "starting service token refresh routine");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "failed to renew service tokens");
                    }
                }
            }
        }

        info!("stopping service token refresh routine");
    }
}

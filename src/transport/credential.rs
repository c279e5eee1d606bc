//! Credentials for the realtime endpoint

use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::{Error, Result};

/// Supplies the credential used for one connect attempt
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Fetch a credential
    ///
    /// # Errors
    ///
    /// Returns error if no credential can be obtained
    async fn credential(&self) -> Result<SecretString>;
}

/// A fixed, long-lived API key
pub struct StaticCredential(SecretString);

impl StaticCredential {
    /// Wrap a key
    #[must_use]
    pub const fn new(key: SecretString) -> Self {
        Self(key)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn credential(&self) -> Result<SecretString> {
        Ok(self.0.clone())
    }
}

/// Ephemeral session token response
#[derive(serde::Deserialize)]
struct SessionTokenResponse {
    client_secret: ClientSecret,
}

#[derive(serde::Deserialize)]
struct ClientSecret {
    value: String,
}

/// Upper bound for one token request
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Mints a short-lived credential from the POS backend for every attempt
pub struct HttpCredentialProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpCredentialProvider {
    /// Create a provider for a token endpoint
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn credential(&self) -> Result<SecretString> {
        let response = self.client.post(&self.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ConnectionFailed(format!(
                "credential endpoint returned {status}: {body}"
            )));
        }

        let token: SessionTokenResponse = response.json().await?;
        tracing::debug!("obtained ephemeral realtime credential");
        Ok(SecretString::from(token.client_secret.value))
    }
}

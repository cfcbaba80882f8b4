use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use google_gmail1::oauth2::{
    self, ApplicationSecret, InstalledFlowAuthenticator, InstalledFlowReturnMethod,
    authenticator_delegate::InstalledFlowDelegate, read_application_secret,
    storage::{TokenInfo, TokenStorage},
};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::mpsc;

const APP_NAME: &str = "statement-scan";
const TOKEN_KEY: &str = "gmail_token";

pub const SCOPES: &[&str] = &["https://www.googleapis.com/auth/gmail.readonly"];

pub type GmailAuthenticator = oauth2::authenticator::DefaultAuthenticator;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("No credential available: {0}")]
    NoCredential(String),

    #[error("Sign-in cancelled: {0}")]
    Cancelled(String),

    #[error("Could not parse credential: {0}")]
    CredentialParsing(String),

    #[error("Authentication failed: {0}")]
    Other(String),
}

impl From<oauth2::Error> for AuthError {
    fn from(err: oauth2::Error) -> Self {
        match err {
            oauth2::Error::UserError(msg) => AuthError::Cancelled(msg),
            oauth2::Error::MissingAccessToken => {
                AuthError::NoCredential("server returned no access token".to_string())
            }
            oauth2::Error::AuthError(e) => AuthError::NoCredential(e.to_string()),
            oauth2::Error::JSONError(e) => AuthError::CredentialParsing(e.to_string()),
            other => AuthError::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenData {
    tokens: Vec<TokenInfo>,
}

/// Keeps the OAuth token in the OS keyring.
pub struct RingStorage;

#[async_trait]
impl TokenStorage for RingStorage {
    async fn set(&self, _scopes: &[&str], token: TokenInfo) -> Result<()> {
        let entry = Entry::new(APP_NAME, TOKEN_KEY)
            .map_err(|e| anyhow::anyhow!("Keyring error: {}", e))?;

        let data = TokenData {
            tokens: vec![token],
        };
        let serialized = serde_json::to_string(&data).context("Failed to serialize tokens")?;

        entry
            .set_password(&serialized)
            .map_err(|e| anyhow::anyhow!("Keyring error: {}", e))?;

        Ok(())
    }

    async fn get(&self, _scopes: &[&str]) -> Option<TokenInfo> {
        match self.get_all().await {
            Ok(data) => data.tokens.into_iter().next(),
            Err(e) => {
                tracing::warn!("Could not read stored token: {:#}", e);
                None
            }
        }
    }
}

impl RingStorage {
    async fn get_all(&self) -> Result<TokenData> {
        let entry = Entry::new(APP_NAME, TOKEN_KEY)
            .map_err(|e| anyhow::anyhow!("Keyring error: {}", e))?;

        match entry.get_password() {
            Ok(serialized) => {
                serde_json::from_str(&serialized).context("Failed to deserialize tokens")
            }
            Err(keyring::Error::NoEntry) => Ok(TokenData::default()),
            Err(e) => Err(anyhow::anyhow!("Keyring error: {}", e)),
        }
    }

    pub async fn has_token(&self) -> bool {
        self.get(SCOPES).await.is_some()
    }

    pub async fn clear_token(&self) -> Result<()> {
        let entry = Entry::new(APP_NAME, TOKEN_KEY)
            .map_err(|e| anyhow::anyhow!("Keyring error: {}", e))?;

        match entry.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("Keyring error: {}", e)),
        }
    }
}

/// Forwards the consent URL to the UI and tries to open a browser.
pub struct TuiDelegate {
    pub tx: mpsc::Sender<String>,
}

impl InstalledFlowDelegate for TuiDelegate {
    fn present_user_url<'a>(
        &'a self,
        url: &'a str,
        _need_code: bool,
    ) -> BoxFuture<'a, std::result::Result<String, String>> {
        Box::pin(async move {
            tracing::info!("Presenting consent URL");
            self.tx
                .send(url.to_string())
                .await
                .map_err(|_| "UI is no longer listening".to_string())?;

            if let Err(e) = open::that(url) {
                tracing::debug!("Could not open browser: {}", e);
            }

            // HTTPRedirect catches the code itself; nothing to type in.
            Ok(String::new())
        })
    }
}

pub struct Authenticator;

impl Authenticator {
    pub async fn load_secret<P: AsRef<Path>>(path: P) -> Result<ApplicationSecret> {
        let path = path.as_ref();
        read_application_secret(path)
            .await
            .with_context(|| format!("Failed to read application secret {}", path.display()))
    }

    /// Runs the installed-app flow until a read-only Gmail token is in hand.
    pub async fn sign_in(
        secret: ApplicationSecret,
        delegate: TuiDelegate,
    ) -> std::result::Result<GmailAuthenticator, AuthError> {
        tracing::info!("Starting sign-in for client {}", secret.client_id);

        let auth = InstalledFlowAuthenticator::builder(
            secret,
            InstalledFlowReturnMethod::HTTPRedirect,
        )
        .with_storage(Box::new(RingStorage))
        .flow_delegate(Box::new(delegate))
        .build()
        .await
        .map_err(|e| {
            tracing::error!("Failed to build authenticator: {}", e);
            AuthError::Other(e.to_string())
        })?;

        if let Err(e) = auth.token(SCOPES).await {
            let err = AuthError::from(e);
            tracing::error!("Sign-in failed: {}", err);
            return Err(err);
        }

        tracing::info!("Sign-in succeeded");
        Ok(auth)
    }

    pub async fn sign_out() -> Result<()> {
        tracing::info!("Signing out");
        RingStorage.clear_token().await.map_err(|e| {
            tracing::error!("Error during sign out: {:#}", e);
            e
        })
    }
}

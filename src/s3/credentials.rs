//! S3 Credentials Module
//!
//! Resolves the credential pair used to sign storage requests.
//!
//! # Sources
//!
//! - Configuration (`storage.access_key` / `storage.secret_key`)
//! - Environment (`ACCESS_KEY` / `SECRET_KEY`, then the standard
//!   `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`)
//!
//! # Example
//!
//! ```
//! use mizuchi_media::s3::Credentials;
//!
//! let creds = Credentials::new("access-key", "secret-key");
//! assert_eq!(creds.access_key_id(), "access-key");
//! assert_eq!(creds.secret_access_key(), "secret-key");
//! ```

use crate::config::StorageConfig;
use thiserror::Error;

/// Credential loading errors
#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),
}

/// Credentials for AWS authentication
#[derive(Clone)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field("session_token", &self.session_token.as_ref().map(|_| "** redacted **"))
            .finish()
    }
}

impl Credentials {
    /// Create new credentials
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Create credentials with session token (for temporary credentials)
    pub fn with_session_token(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: Some(session_token.into()),
        }
    }

    /// Get the access key ID
    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    /// Get the secret access key
    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    /// Get the session token (if any)
    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub(crate) fn to_aws(&self) -> aws_credential_types::Credentials {
        aws_credential_types::Credentials::new(
            self.access_key_id.clone(),
            self.secret_access_key.clone(),
            self.session_token.clone(),
            None,
            "mizuchi-media",
        )
    }
}

/// Factory methods for loading credentials
pub struct CredentialsProvider;

impl CredentialsProvider {
    /// Load credentials from environment variables
    ///
    /// Looks for `ACCESS_KEY`/`SECRET_KEY` first, then
    /// `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY` with an optional
    /// `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Credentials, CredentialsError> {
        if let (Ok(access_key), Ok(secret_key)) =
            (std::env::var("ACCESS_KEY"), std::env::var("SECRET_KEY"))
        {
            return Self::checked(access_key, secret_key, None);
        }

        let access_key = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
            CredentialsError::MissingCredentials("AWS_ACCESS_KEY_ID not set".into())
        })?;

        let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            CredentialsError::MissingCredentials("AWS_SECRET_ACCESS_KEY not set".into())
        })?;

        Self::checked(access_key, secret_key, std::env::var("AWS_SESSION_TOKEN").ok())
    }

    /// Load credentials from storage configuration
    pub fn from_config(config: &StorageConfig) -> Result<Credentials, CredentialsError> {
        let access_key = config.access_key.as_ref().ok_or_else(|| {
            CredentialsError::MissingCredentials("access_key not set in config".into())
        })?;

        let secret_key = config.secret_key.as_ref().ok_or_else(|| {
            CredentialsError::MissingCredentials("secret_key not set in config".into())
        })?;

        Self::checked(access_key.clone(), secret_key.clone(), None)
    }

    fn checked(
        access_key: String,
        secret_key: String,
        session_token: Option<String>,
    ) -> Result<Credentials, CredentialsError> {
        // Unexpanded ${VAR} placeholders end up here when the variable is unset
        if access_key.trim().is_empty() || access_key.starts_with("${") {
            return Err(CredentialsError::InvalidCredentials(
                "access key is empty or unresolved".into(),
            ));
        }
        if secret_key.trim().is_empty() || secret_key.starts_with("${") {
            return Err(CredentialsError::InvalidCredentials(
                "secret key is empty or unresolved".into(),
            ));
        }

        Ok(match session_token {
            Some(token) => Credentials::with_session_token(access_key, secret_key, token),
            None => Credentials::new(access_key, secret_key),
        })
    }
}

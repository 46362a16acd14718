use std::fmt;

use kpl_frame::Message;
use serde::{Deserialize, Serialize};

/// Sentinel id carried by every set-credentials message.
pub(crate) const SET_CREDENTIALS_ID: u64 = u64::MAX;

/// AWS-style credentials handed to the child.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key. Redacted in debug output.
    pub secret_key: String,
    /// Session token for temporary credentials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Credentials");
        dbg.field("access_key_id", &self.access_key_id);
        dbg.field(
            "secret_key",
            &format_args!("<redacted:{} bytes>", self.secret_key.len()),
        );
        if let Some(token) = &self.session_token {
            dbg.field(
                "session_token",
                &format_args!("<redacted:{} bytes>", token.len()),
            );
        } else {
            dbg.field("session_token", &Option::<String>::None);
        }
        dbg.finish()
    }
}

/// Errors from credential resolution or encoding.
#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    /// The provider could not resolve credentials.
    #[error("credentials unavailable: {0}")]
    Unavailable(String),

    /// The set-credentials message could not be serialized.
    #[error("failed to serialize set-credentials message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Pluggable source of credentials.
///
/// Resolved once at child launch and again on every refresh cycle. Errors
/// during refresh are logged and the refresh loop continues.
pub trait CredentialsProvider: Send + Sync {
    /// Resolve the current credentials.
    fn credentials(&self) -> Result<Credentials, CredentialsError>;
}

/// Provider that always returns the same credentials.
#[derive(Debug, Clone)]
pub struct StaticCredentialsProvider {
    credentials: Credentials,
}

impl StaticCredentialsProvider {
    /// Wrap fixed credentials.
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl CredentialsProvider for StaticCredentialsProvider {
    fn credentials(&self) -> Result<Credentials, CredentialsError> {
        Ok(self.credentials.clone())
    }
}

/// Typed control message instructing the child to swap credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct SetCredentials {
    pub(crate) credentials: Credentials,
    pub(crate) for_metrics: bool,
    pub(crate) id: u64,
}

/// Resolve credentials from `provider` and encode the set-credentials
/// control message for the wire.
pub(crate) fn set_credentials_message(
    provider: &dyn CredentialsProvider,
    for_metrics: bool,
) -> Result<Message, CredentialsError> {
    let body = SetCredentials {
        credentials: provider.credentials()?,
        for_metrics,
        id: SET_CREDENTIALS_ID,
    };
    Ok(Message::new(serde_json::to_vec(&body)?))
}

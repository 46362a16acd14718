use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::credentials::CredentialsProvider;

/// Default interval between credential refresh cycles.
pub const DEFAULT_CREDENTIALS_REFRESH_DELAY: Duration = Duration::from_secs(5);

/// Supervisor configuration.
///
/// Carries the opaque serialized producer configuration handed to the child
/// on its command line, the credentials providers, the refresh cadence, and
/// environment-variable overrides merged into the child's environment.
#[derive(Clone)]
pub struct DaemonConfig {
    config_message: Bytes,
    credentials: Arc<dyn CredentialsProvider>,
    metrics_credentials: Option<Arc<dyn CredentialsProvider>>,
    credentials_refresh_delay: Duration,
    environment: HashMap<String, String>,
}

impl DaemonConfig {
    /// Build a configuration from the serialized producer configuration and
    /// the primary credentials provider.
    pub fn new(
        config_message: impl Into<Bytes>,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Self {
        Self {
            config_message: config_message.into(),
            credentials,
            metrics_credentials: None,
            credentials_refresh_delay: DEFAULT_CREDENTIALS_REFRESH_DELAY,
            environment: HashMap::new(),
        }
    }

    /// Use a dedicated provider for metrics credentials.
    pub fn with_metrics_credentials(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.metrics_credentials = Some(provider);
        self
    }

    /// Override the credential refresh interval.
    pub fn with_credentials_refresh_delay(mut self, delay: Duration) -> Self {
        self.credentials_refresh_delay = delay;
        self
    }

    /// Add an environment variable passed to the child, overriding any value
    /// inherited from the parent environment.
    pub fn with_environment_variable(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// The opaque serialized producer configuration.
    pub fn config_message(&self) -> &Bytes {
        &self.config_message
    }

    /// The primary credentials provider.
    pub fn credentials_provider(&self) -> &Arc<dyn CredentialsProvider> {
        &self.credentials
    }

    /// The metrics credentials provider, falling back to the primary
    /// provider when none is set.
    pub fn metrics_credentials_provider(&self) -> &Arc<dyn CredentialsProvider> {
        self.metrics_credentials.as_ref().unwrap_or(&self.credentials)
    }

    /// Interval between credential refresh cycles.
    pub fn credentials_refresh_delay(&self) -> Duration {
        self.credentials_refresh_delay
    }

    /// Environment-variable overrides for the child.
    pub fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }
}

impl fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("config_message_len", &self.config_message.len())
            .field("has_metrics_credentials", &self.metrics_credentials.is_some())
            .field("credentials_refresh_delay", &self.credentials_refresh_delay)
            .field("environment_keys", &self.environment.keys().collect::<Vec<_>>())
            .finish()
    }
}

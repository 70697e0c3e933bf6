//! Memoized transport factory
//!
//! Transports are rebuilt only when one of their explicit dependencies
//! changes. Repeated requests with the same key share one instance. Only the
//! most recent key is kept, so a replaced credential does not outlive the
//! next request.

use super::{AnthropicTransport, LlmError, LlmTransport, LoggingTransport};
use crate::config::{ClientConfig, ConfigError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Everything a transport instance depends on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportKey {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl TransportKey {
    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: config.base_url.clone(),
            api_key: config.require_api_key()?.to_string(),
            model: config.model.clone(),
        })
    }
}

type Factory = dyn Fn(&TransportKey) -> Result<Arc<dyn LlmTransport>, LlmError> + Send + Sync;

/// Cache of transports keyed by their dependencies
pub struct TransportRegistry {
    factory: Box<Factory>,
    transports: Mutex<HashMap<TransportKey, Arc<dyn LlmTransport>>>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRegistry {
    /// Registry that builds Anthropic transports
    pub fn new() -> Self {
        Self::with_factory(|key| {
            let transport =
                AnthropicTransport::new(key.api_key.clone(), &key.base_url, &key.model)?;
            Ok(Arc::new(transport))
        })
    }

    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn(&TransportKey) -> Result<Arc<dyn LlmTransport>, LlmError> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            transports: Mutex::new(HashMap::new()),
        }
    }

    /// Get the transport for `key`, creating it on first use. Transports for
/// any other key are evicted once the new one exists.
    pub fn get(&self, key: &TransportKey) -> Result<Arc<dyn LlmTransport>, LlmError> {
        let mut transports = self
            .transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = transports.get(key) {
            return Ok(existing.clone());
        }

        let created = (self.factory)(key)?;
        let transport: Arc<dyn LlmTransport> = Arc::new(LoggingTransport::new(created));
        tracing::debug!(model = %key.model, base_url = %key.base_url, "Created transport");
        if !transports.is_empty() {
            tracing::debug!(evicted = transports.len(), "Dropping transports for a previous key");
            transports.clear();
        }
        transports.insert(key.clone(), transport.clone());
        Ok(transport)
    }

    /// Resolve a transport straight from configuration
    pub fn for_config(&self, config: &ClientConfig) -> Result<Arc<dyn LlmTransport>, RegistryError> {
        let key = TransportKey::from_config(config)?;
        Ok(self.get(&key)?)
    }

    pub fn len(&self) -> usize {
        self.transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Failure to produce a transport from configuration
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] LlmError),
}

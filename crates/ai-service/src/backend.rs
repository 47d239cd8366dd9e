//! Boundary contracts for the external completion backend
//!
//! The resilience layer never talks to the wire itself. It consumes a client
//! capability (construct, complete, validate) and a health probe, and emits
//! alerts through a sink. All four are injected trait objects.

use crate::errors::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Chat message handed to the completion backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: MessageRole::System,
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: MessageRole::User,
            content: content.to_string(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.to_string(),
        }
    }
}

/// Stored (application-managed) credentials for the primary strategy.
#[derive(Clone)]
pub struct StoredCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Where a client construction attempt takes its credentials from.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    Stored(StoredCredentials),
    Environment {
        access_key_id: String,
        secret_access_key: String,
    },
    /// No explicit credentials; the platform's default resolution chain.
    DefaultChain,
}

/// Full configuration passed to [`ClientBuilder::construct`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub provider: String,
    pub model: String,
    pub region: Option<String>,
    pub credentials: CredentialSource,
}

/// A live backend client. Constructed by a [`ClientBuilder`], cached by the
/// factory, exercised by the report-generation path.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Send a conversation to the backend and return the completion text.
    async fn generate_completion(&self, messages: &[ChatMessage]) -> Result<String, BackendError>;

    /// Cheap probe that a constructed client is actually usable.
    async fn validate_availability(&self) -> Result<(), BackendError>;
}

/// Constructor capability for backend clients. Wire protocol is the
/// implementor's concern.
#[async_trait]
pub trait ClientBuilder: Send + Sync {
    async fn construct(
        &self,
        config: &ClientConfig,
    ) -> Result<Arc<dyn CompletionClient>, BackendError>;
}

/// Structured status returned by the health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health endpoint consumed by the service monitor.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<HealthStatus, BackendError>;
}

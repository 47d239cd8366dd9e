//! Report-generation path with typed fallback
//!
//! The enhancer either returns AI-generated analysis or a deterministic
//! basic-template report plus a [`ReportGenerationFallbackInfo`] explaining
//! why the enhancement was skipped. It never propagates a backend failure.

use crate::circuit_breaker::CircuitBreaker;
use crate::errors::{classify_error, BackendError, ErrorKind};
use crate::factory::{ServiceFactory, ServiceOptions};
use crate::monitor::ServiceMonitor;
use crate::backend::ChatMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Why an enhancement attempt fell back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    BedrockUnavailable,
    InitializationFailed,
    ValidationFailed,
    Timeout,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::BedrockUnavailable => "bedrock_unavailable",
            FallbackReason::InitializationFailed => "initialization_failed",
            FallbackReason::ValidationFailed => "validation_failed",
            FallbackReason::Timeout => "timeout",
        }
    }
}

/// What kind of degraded content was substituted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackType {
    BasicTemplate,
    CachedResult,
    MinimalAnalysis,
}

/// Metadata attached to a degraded result so callers can surface an honest
/// "AI enhancement unavailable" notice instead of a silently weaker report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportGenerationFallbackInfo {
    pub reason: FallbackReason,
    pub timestamp: DateTime<Utc>,
    pub fallback_type: FallbackType,
    pub original_error: String,
}

/// Always-renderable result of an enhancement attempt.
#[derive(Debug, Clone)]
pub struct EnhancedContent {
    pub content: String,
    pub fallback_info: Option<ReportGenerationFallbackInfo>,
}

/// One comparative-analysis request from the report layer.
#[derive(Debug, Clone)]
pub struct ReportRequest {
    /// Project or product the analysis is about; used in the basic template
    pub subject: String,
    pub messages: Vec<ChatMessage>,
}

impl ReportRequest {
    pub fn new(subject: &str, messages: Vec<ChatMessage>) -> Self {
        Self {
            subject: subject.to_string(),
            messages,
        }
    }
}

enum StageError {
    Initialization(anyhow::Error),
    Validation(anyhow::Error),
    Completion(anyhow::Error),
}

/// Orchestrates pool acquisition, availability validation and the completion
/// call, degrading to the basic template on any failure.
pub struct ReportEnhancer {
    factory: Arc<ServiceFactory>,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<ServiceMonitor>,
    options: ServiceOptions,
}

impl ReportEnhancer {
    pub fn new(
        factory: Arc<ServiceFactory>,
        breaker: Arc<CircuitBreaker>,
        monitor: Arc<ServiceMonitor>,
        options: ServiceOptions,
    ) -> Self {
        Self {
            factory,
            breaker,
            monitor,
            options,
        }
    }

    /// Generate analysis content. Infallible by design: every failure mode
    /// becomes a basic-template result with typed fallback info.
    pub async fn generate_enhanced_content(&self, request: &ReportRequest) -> EnhancedContent {
        let started = Instant::now();
        match self.try_enhanced(request).await {
            Ok(content) => {
                self.monitor.record_request(started, true).await;
                debug!("AI-enhanced content generated for '{}'", request.subject);
                EnhancedContent {
                    content,
                    fallback_info: None,
                }
            }
            Err(stage) => {
                self.monitor.record_request(started, false).await;
                let (reason, original_error) = classify_stage(&stage);
                warn!(
                    "AI enhancement unavailable for '{}' ({}): {}",
                    request.subject,
                    reason.as_str(),
                    original_error
                );
                EnhancedContent {
                    content: basic_template(&request.subject, reason),
                    fallback_info: Some(ReportGenerationFallbackInfo {
                        reason,
                        timestamp: Utc::now(),
                        fallback_type: FallbackType::BasicTemplate,
                        original_error,
                    }),
                }
            }
        }
    }

    async fn try_enhanced(&self, request: &ReportRequest) -> Result<String, StageError> {
        let client = self
            .factory
            .create_service(&self.options)
            .await
            .map_err(StageError::Initialization)?;

        // A freshly constructed client is not assumed good; probe it first.
        // The probe is bounded by the breaker's timeout but stays outside its
        // failure bookkeeping so it cannot mask completion failures.
        match tokio::time::timeout(
            self.breaker.operation_timeout(),
            client.validate_availability(),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(StageError::Validation(err.into())),
            Err(_) => {
                return Err(StageError::Validation(anyhow::Error::new(
                    BackendError::Timeout("availability validation timed out".to_string()),
                )))
            }
        }

        self.breaker
            .execute(async { Ok(client.generate_completion(&request.messages).await?) })
            .await
            .map_err(StageError::Completion)
    }
}

fn classify_stage(stage: &StageError) -> (FallbackReason, String) {
    let (err, stage_reason) = match stage {
        StageError::Initialization(err) => (err, FallbackReason::InitializationFailed),
        StageError::Validation(err) => (err, FallbackReason::ValidationFailed),
        StageError::Completion(err) => (err, FallbackReason::BedrockUnavailable),
    };
    let reason = if classify_error(err) == ErrorKind::Timeout {
        FallbackReason::Timeout
    } else {
        stage_reason
    };
    (reason, format!("{err:#}"))
}

fn basic_template(subject: &str, reason: FallbackReason) -> String {
    format!(
        "# Competitive Analysis: {subject}\n\n\
         > AI enhancement unavailable ({}). Showing the basic report template.\n\n\
         ## Overview\n\
         This report was assembled without AI assistance. It covers the tracked \
         products, competitors and recent snapshot activity for {subject}. Re-run \
         the analysis once the AI backend is reachable to get comparative insights.\n",
        reason.as_str(),
    )
}
